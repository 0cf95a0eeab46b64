//! The sidechain adapter (C1, §4.1): reads/writes the bridge contract, and
//! signs/recovers the EIP-191 messages every federator artefact carries.

pub mod adapter;
pub mod contract;

use async_trait::async_trait;
use ethers::types::{Address, Signature, H256};
use std::collections::HashSet;

use crate::domain::transfer::{TransferId, TransferStatus};
use crate::error::Result;

pub use adapter::EthChainAdapter;

/// The contract's view of a single transfer at a given block (§4.4 needs both
/// the current and the `current − required_confirmations` snapshot).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferView {
    pub status: TransferStatus,
    pub total_amount_sat: u64,
}

/// One raw log, decoded (§4.1 `scan_events`).
#[derive(Debug, Clone)]
pub enum ChainEvent {
    NewTransfer {
        transfer_id: TransferId,
        btc_address: String,
        nonce: u8,
        total_amount_sat: u64,
        origin_address: String,
        origin_tx_hash: H256,
        origin_log_index: u64,
        origin_block_number: u64,
    },
    StatusUpdated {
        transfer_id: TransferId,
        status: TransferStatus,
    },
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    async fn current_block(&self) -> Result<u64>;

    /// `at_block = None` means "latest".
    async fn get_transfer(&self, btc_address: &str, nonce: u8, at_block: Option<u64>) -> Result<TransferView>;

    async fn get_update_hash_for_sending(&self, bitcoin_tx_hash: H256, transfer_ids: &[TransferId]) -> Result<H256>;

    async fn get_update_hash_for_mined(&self, transfer_ids: &[TransferId]) -> Result<H256>;

    async fn federators(&self) -> Result<HashSet<Address>>;

    async fn mark_as_sending(
        &self,
        bitcoin_tx_hash: H256,
        transfer_ids: &[TransferId],
        signatures: &[(Address, Signature)],
    ) -> Result<()>;

    async fn mark_as_mined(&self, transfer_ids: &[TransferId], signatures: &[(Address, Signature)]) -> Result<()>;

    /// Sign the raw bytes of an update hash with this node's sidechain key,
    /// applying the EIP-191 prefix (§4.1).
    async fn sign_message(&self, message: &[u8]) -> Result<Signature>;

    fn recover(&self, message: &[u8], signature: &Signature) -> Result<Address>;

    fn own_address(&self) -> Address;

    /// Scan `[from_block, to_block]` in retry-capable batches, returning
    /// decoded events in log order (§4.1).
    async fn scan_events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>>;
}
