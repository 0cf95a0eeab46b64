//! A single user's request to receive Bitcoin (§3).

use ethers::types::H256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::{Error, Result};

/// Nonce 255 is reserved and never valid (§3, §4.2.5).
pub const RESERVED_NONCE: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub [u8; 32]);

impl TransferId {
    /// `transfer_id = keccak256(btc_address_lowercase ‖ nonce_uint256_be)` (§6).
    pub fn derive(btc_address: &str, nonce: u8) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(btc_address.to_lowercase().as_bytes());
        let mut nonce_be = [0u8; 32];
        nonce_be[31] = nonce;
        hasher.update(nonce_be);
        let digest: [u8; 32] = hasher.finalize().into();
        TransferId(digest)
    }

    pub fn as_h256(&self) -> H256 {
        H256::from(self.0)
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Chain-side status, monotone non-decreasing along the happy path
/// New -> Sending -> Mined (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    New,
    Sending,
    Mined,
    Refunded,
    Reclaimed,
}

impl TransferStatus {
    /// Ordinal along the happy path only; `Refunded`/`Reclaimed` are terminal
    /// side exits and are not comparable to the happy-path ordinals.
    fn happy_path_ordinal(&self) -> Option<u8> {
        match self {
            TransferStatus::New => Some(0),
            TransferStatus::Sending => Some(1),
            TransferStatus::Mined => Some(2),
            TransferStatus::Refunded | TransferStatus::Reclaimed => None,
        }
    }

    /// `true` if moving from `self` to `next` is a legal forward transition.
    pub fn can_advance_to(&self, next: TransferStatus) -> bool {
        match (self.happy_path_ordinal(), next.happy_path_ordinal()) {
            (Some(a), Some(b)) => b == a + 1 || b == a,
            _ => matches!(next, TransferStatus::Refunded | TransferStatus::Reclaimed),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Mined | TransferStatus::Refunded | TransferStatus::Reclaimed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    pub btc_address: String,
    pub nonce: u8,
    pub total_amount_sat: u64,
    pub origin_address: String,
    pub origin_tx_hash: H256,
    pub origin_log_index: u64,
    pub origin_block_number: u64,
    pub bitcoin_tx_hash: Option<H256>,
}

impl Transfer {
    pub fn new(
        btc_address: String,
        nonce: u8,
        total_amount_sat: u64,
        origin_address: String,
        origin_tx_hash: H256,
        origin_log_index: u64,
        origin_block_number: u64,
    ) -> Result<Self> {
        if nonce == RESERVED_NONCE {
            return Err(Error::validation(format!(
                "nonce {RESERVED_NONCE} is reserved and cannot be used"
            )));
        }
        let transfer_id = TransferId::derive(&btc_address, nonce);
        Ok(Self {
            transfer_id,
            status: TransferStatus::New,
            btc_address,
            nonce,
            total_amount_sat,
            origin_address,
            origin_tx_hash,
            origin_log_index,
            origin_block_number,
            bitcoin_tx_hash: None,
        })
    }

    /// `(block, tx_index, log_index)` ordering key used for deterministic
    /// batch composition (§4.3 `next_new_transfers`).
    pub fn ordering_key(&self) -> (u64, u64, u64) {
        (self.origin_block_number, self.origin_log_index, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_255_is_rejected() {
        let result = Transfer::new(
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string(),
            255,
            100_000,
            "0xabc".to_string(),
            H256::zero(),
            0,
            100,
        );
        assert!(result.is_err());
    }

    #[test]
    fn transfer_id_is_deterministic_and_address_case_insensitive() {
        let lower = TransferId::derive("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", 0);
        let upper = TransferId::derive("BCRT1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4", 0);
        assert_eq!(lower, upper);
    }

    #[test]
    fn different_nonce_yields_different_id() {
        let a = TransferId::derive("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", 0);
        let b = TransferId::derive("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn status_advances_monotonically() {
        assert!(TransferStatus::New.can_advance_to(TransferStatus::Sending));
        assert!(TransferStatus::Sending.can_advance_to(TransferStatus::Mined));
        assert!(!TransferStatus::Mined.can_advance_to(TransferStatus::New));
        assert!(!TransferStatus::New.can_advance_to(TransferStatus::Mined));
    }
}
