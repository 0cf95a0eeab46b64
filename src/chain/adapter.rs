//! `EthChainAdapter`: the concrete [`ChainAdapter`] backed by an `ethers`
//! JSON-RPC provider and this node's sidechain signing key.

use std::collections::HashSet;
use std::sync::Arc;

use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::LocalWallet;
use ethers::types::{Address, Signature, H256};

use crate::chain::contract::{
    FastBtcBridge, STATUS_MINED, STATUS_NEW, STATUS_RECLAIMED, STATUS_REFUNDED, STATUS_SENDING,
};
use crate::chain::{ChainAdapter, ChainEvent, TransferView};
use crate::config::ChainConfig;
use crate::crypto::eip191;
use crate::domain::transfer::{TransferId, TransferStatus};
use crate::error::{Error, Result};
use crate::utils::timeout::{timed_rpc, Timeouts};

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EthChainAdapter {
    contract: FastBtcBridge<Client>,
    client: Arc<Client>,
    wallet: LocalWallet,
    config: ChainConfig,
    timeouts: Timeouts,
}

impl EthChainAdapter {
    pub fn new(config: ChainConfig, wallet: LocalWallet) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| Error::Chain(format!("invalid rpc url {}: {e}", config.rpc_url)))?;
        let address: Address = config
            .bridge_contract_address
            .parse()
            .map_err(|e| Error::Config(format!("invalid bridge contract address: {e}")))?;
        let client = Arc::new(SignerMiddleware::new(provider, wallet.clone()));
        let contract = FastBtcBridge::new(address, client.clone());
        Ok(Self {
            contract,
            client,
            wallet,
            config,
            timeouts: Timeouts::default(),
        })
    }

    fn status_from_u8(raw: u8) -> Result<TransferStatus> {
        match raw {
            STATUS_NEW => Ok(TransferStatus::New),
            STATUS_SENDING => Ok(TransferStatus::Sending),
            STATUS_MINED => Ok(TransferStatus::Mined),
            STATUS_REFUNDED => Ok(TransferStatus::Refunded),
            STATUS_RECLAIMED => Ok(TransferStatus::Reclaimed),
            other => Err(Error::Chain(format!("unknown transfer status code {other}"))),
        }
    }

    fn status_to_u8(status: TransferStatus) -> u8 {
        match status {
            TransferStatus::New => STATUS_NEW,
            TransferStatus::Sending => STATUS_SENDING,
            TransferStatus::Mined => STATUS_MINED,
            TransferStatus::Refunded => STATUS_REFUNDED,
            TransferStatus::Reclaimed => STATUS_RECLAIMED,
        }
    }
}

#[async_trait::async_trait]
impl ChainAdapter for EthChainAdapter {
    async fn current_block(&self) -> Result<u64> {
        let block = timed_rpc("eth_blockNumber", &self.timeouts, async {
            self.client
                .get_block_number()
                .await
                .map_err(|e| Error::Chain(format!("current_block: {e}")))
        })
        .await?;
        Ok(block.as_u64())
    }

    async fn get_transfer(&self, btc_address: &str, nonce: u8, at_block: Option<u64>) -> Result<TransferView> {
        let mut call = self.contract.get_transfer(btc_address.to_string(), nonce);
        if let Some(block) = at_block {
            call = call.block(block);
        }

        let (_rsk_address, raw_status, _nonce, _fee_structure_index, _block_number, total_amount_sat, _btc_address) =
            timed_rpc("getTransfer", &self.timeouts, async {
                call.call().await.map_err(|e| Error::Chain(format!("getTransfer: {e}")))
            })
            .await?;

        Ok(TransferView {
            status: Self::status_from_u8(raw_status)?,
            total_amount_sat: total_amount_sat.as_u64(),
        })
    }

    async fn get_update_hash_for_sending(&self, bitcoin_tx_hash: H256, transfer_ids: &[TransferId]) -> Result<H256> {
        let ids: Vec<[u8; 32]> = transfer_ids.iter().map(|t| t.0).collect();
        let hash = self
            .contract
            .get_transfer_batch_update_hash_with_tx_hash(bitcoin_tx_hash.0, ids, Self::status_to_u8(TransferStatus::Sending))
            .call()
            .await
            .map_err(|e| Error::Chain(format!("getTransferBatchUpdateHashWithTxHash: {e}")))?;
        Ok(H256(hash))
    }

    async fn get_update_hash_for_mined(&self, transfer_ids: &[TransferId]) -> Result<H256> {
        let ids: Vec<[u8; 32]> = transfer_ids.iter().map(|t| t.0).collect();
        let hash = self
            .contract
            .get_transfer_batch_update_hash(ids, Self::status_to_u8(TransferStatus::Mined))
            .call()
            .await
            .map_err(|e| Error::Chain(format!("getTransferBatchUpdateHash: {e}")))?;
        Ok(H256(hash))
    }

    async fn federators(&self) -> Result<HashSet<Address>> {
        let addresses = self
            .contract
            .federators()
            .call()
            .await
            .map_err(|e| Error::Chain(format!("federators: {e}")))?;
        Ok(addresses.into_iter().collect())
    }

    async fn mark_as_sending(
        &self,
        bitcoin_tx_hash: H256,
        transfer_ids: &[TransferId],
        signatures: &[(Address, Signature)],
    ) -> Result<()> {
        let ids: Vec<[u8; 32]> = transfer_ids.iter().map(|t| t.0).collect();
        let sigs: Vec<ethers::types::Bytes> = signatures.iter().map(|(_, s)| s.to_vec().into()).collect();
        self.contract
            .mark_transfers_as_sending(bitcoin_tx_hash.0, ids, sigs)
            .send()
            .await
            .map_err(|e| Error::Chain(format!("markTransfersAsSending: {e}")))?
            .await
            .map_err(|e| Error::Chain(format!("markTransfersAsSending confirmation: {e}")))?;
        Ok(())
    }

    async fn mark_as_mined(&self, transfer_ids: &[TransferId], signatures: &[(Address, Signature)]) -> Result<()> {
        let ids: Vec<[u8; 32]> = transfer_ids.iter().map(|t| t.0).collect();
        let sigs: Vec<ethers::types::Bytes> = signatures.iter().map(|(_, s)| s.to_vec().into()).collect();
        self.contract
            .mark_transfers_as_mined(ids, sigs)
            .send()
            .await
            .map_err(|e| Error::Chain(format!("markTransfersAsMined: {e}")))?
            .await
            .map_err(|e| Error::Chain(format!("markTransfersAsMined confirmation: {e}")))?;
        Ok(())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        eip191::sign_message(&self.wallet, message).await
    }

    fn recover(&self, message: &[u8], signature: &Signature) -> Result<Address> {
        eip191::recover_address(message, signature)
    }

    fn own_address(&self) -> Address {
        use ethers::signers::Signer;
        self.wallet.address()
    }

    async fn scan_events(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>> {
        let mut events = Vec::new();
        let mut start = from_block;
        while start <= to_block {
            let end = (start + self.config.event_scan_batch_size - 1).min(to_block);
            let batch = self.scan_batch_with_retries(start, end).await?;
            events.extend(batch);
            start = end + 1;
        }
        Ok(events)
    }
}

impl EthChainAdapter {
    async fn scan_batch_with_retries(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>> {
        let mut attempt = 0;
        loop {
            match self.scan_batch(from_block, to_block).await {
                Ok(events) => return Ok(events),
                Err(e) if attempt < self.config.event_scan_max_retries => {
                    attempt += 1;
                    tracing::warn!(from_block, to_block, attempt, error = %e, "event scan batch failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn scan_batch(&self, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>> {
        let mut events = Vec::new();

        let new_transfer_events = self
            .contract
            .new_transfer_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query_with_meta()
            .await
            .map_err(|e| Error::Chain(format!("scan_events NewTransfer: {e}")))?;

        for (event, meta) in new_transfer_events {
            let transfer_id = TransferId(event.transfer_id);
            events.push(ChainEvent::NewTransfer {
                transfer_id,
                btc_address: event.btc_address,
                nonce: event.nonce,
                total_amount_sat: event.amount_sat.as_u64(),
                origin_address: format!("{:#x}", event.from),
                origin_tx_hash: meta.transaction_hash,
                origin_log_index: meta.log_index.as_u64(),
                origin_block_number: meta.block_number.as_u64(),
            });
        }

        let status_events = self
            .contract
            .transfer_status_updated_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(|e| Error::Chain(format!("scan_events TransferStatusUpdated: {e}")))?;

        for event in status_events {
            events.push(ChainEvent::StatusUpdated {
                transfer_id: TransferId(event.transfer_id),
                status: Self::status_from_u8(event.status)?,
            });
        }

        Ok(events)
    }
}
