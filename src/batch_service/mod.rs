//! The transfer-batch service (C5, §4.5): the only component that mutates a
//! batch's state. Everything here persists through one [`BatchStore`]
//! transaction per state transition (§5 "Ordering guarantees").

use std::collections::HashSet;
use std::sync::Arc;

use ethers::types::{Address, Signature};

use crate::bitcoin::BitcoinAdapter;
use crate::chain::ChainAdapter;
use crate::config::{BatchConfig, BitcoinConfig, ChainConfig};
use crate::domain::batch::TransferBatch;
use crate::domain::transfer::TransferStatus;
use crate::error::{Error, Result};
use crate::store::BatchStore;
use crate::validator;

pub struct BatchService {
    store: Arc<BatchStore>,
    chain: Arc<dyn ChainAdapter>,
    bitcoin: Arc<dyn BitcoinAdapter>,
    batch_config: BatchConfig,
    chain_config: ChainConfig,
    bitcoin_config: BitcoinConfig,
}

impl BatchService {
    pub fn new(
        store: Arc<BatchStore>,
        chain: Arc<dyn ChainAdapter>,
        bitcoin: Arc<dyn BitcoinAdapter>,
        batch_config: BatchConfig,
        chain_config: ChainConfig,
        bitcoin_config: BitcoinConfig,
    ) -> Self {
        Self {
            store,
            chain,
            bitcoin,
            batch_config,
            chain_config,
            bitcoin_config,
        }
    }

    fn num_required_signers(&self) -> usize {
        self.bitcoin_config.num_required_signers
    }

    fn durable_confirmations(&self) -> u64 {
        self.chain_config.durable_confirmations()
    }

    /// (§4.5) Rehydrate the stored pending batch, or build a fresh in-memory
    /// one from the oldest `New` transfers. The fresh batch is *not*
    /// persisted until [`Self::persist_if_due`] judges it due.
    pub async fn get_current_batch(&self) -> Result<Option<TransferBatch>> {
        if let Some(stored) = self.store.get_current_pending_batch().await? {
            return Ok(Some(stored.into_batch()?));
        }

        let transfers = self.store.next_new_transfers(self.batch_config.max_transfers_in_batch).await?;
        if transfers.is_empty() {
            return Ok(None);
        }

        let psbt = self
            .bitcoin
            .create_partial_tx(&transfers, false, false, Some(self.bitcoin_config.max_inputs_per_tx))
            .await?;
        let bitcoin_tx_hash = self.bitcoin.early_tx_hash(&psbt)?;
        Ok(Some(TransferBatch::new(transfers, bitcoin_tx_hash, psbt)))
    }

    /// A batch is due iff it has reached the size cap, or its oldest transfer
    /// is old enough that waiting longer risks the confirmation window (§4.5).
    pub async fn is_due(&self, batch: &TransferBatch) -> Result<bool> {
        if batch.transfers.len() >= self.batch_config.max_transfers_in_batch {
            return Ok(true);
        }
        let oldest_block = batch.transfers.iter().map(|t| t.origin_block_number).min().unwrap_or(0);
        let current_block = self.chain.current_block().await?;
        Ok(current_block.saturating_sub(oldest_block) >= self.batch_config.max_passed_blocks_in_batch)
    }

    /// Persist `batch` if it wasn't already stored (called once a batch is
    /// judged due; §4.5 step 4 "Do not persist yet").
    pub async fn persist_if_due(&self, batch: &TransferBatch, created_at: i64) -> Result<()> {
        match self.store.upsert(batch, created_at).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(e, Error::AlreadyApplied(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Add `(addr, sig)` sending-update signatures, rejecting duplicates and
    /// once-threshold-met contributions; if the count reaches `M-1` the local
    /// node co-signs (§4.5).
    pub async fn add_sending_signatures(
        &self,
        batch: &mut TransferBatch,
        contributions: Vec<(Address, Signature)>,
    ) -> Result<bool> {
        let required = self.num_required_signers();
        if batch.has_enough_sending_signatures(required) {
            return Ok(false);
        }
        let update_hash = self
            .chain
            .get_update_hash_for_sending(batch.bitcoin_tx_hash, &batch.transfer_ids())
            .await?;
        let federators: HashSet<Address> = self.chain.federators().await?;

        let mut changed = false;
        for (addr, sig) in contributions {
            if batch.sending_signers.contains(&addr) {
                continue;
            }
            if validator::validate_signatures(update_hash.as_bytes(), &[addr], &[sig], &federators).is_err() {
                continue;
            }
            batch.sending_signers.push(addr);
            batch.sending_signatures.push(sig);
            changed = true;
        }

        if batch.sending_signers.len() + 1 == required && !batch.sending_signers.contains(&self.chain.own_address()) {
            let own_sig = self.chain.sign_message(update_hash.as_bytes()).await?;
            batch.sending_signers.push(self.chain.own_address());
            batch.sending_signatures.push(own_sig);
            changed = true;
        }

        Ok(changed)
    }

    /// Analogous to [`Self::add_sending_signatures`] against the mined update
    /// hash (§4.5).
    pub async fn add_mined_signatures(
        &self,
        batch: &mut TransferBatch,
        contributions: Vec<(Address, Signature)>,
    ) -> Result<bool> {
        let required = self.num_required_signers();
        if batch.has_enough_mined_signatures(required) {
            return Ok(false);
        }
        let update_hash = self.chain.get_update_hash_for_mined(&batch.transfer_ids()).await?;
        let federators: HashSet<Address> = self.chain.federators().await?;

        let mut changed = false;
        for (addr, sig) in contributions {
            if batch.mined_signers.contains(&addr) {
                continue;
            }
            if validator::validate_signatures(update_hash.as_bytes(), &[addr], &[sig], &federators).is_err() {
                continue;
            }
            batch.mined_signers.push(addr);
            batch.mined_signatures.push(sig);
            changed = true;
        }

        if batch.mined_signers.len() + 1 == required && !batch.mined_signers.contains(&self.chain.own_address()) {
            let own_sig = self.chain.sign_message(update_hash.as_bytes()).await?;
            batch.mined_signers.push(self.chain.own_address());
            batch.mined_signatures.push(own_sig);
            changed = true;
        }

        Ok(changed)
    }

    /// Combine each contributed PSBT, rejecting empty ones and ones whose
    /// signer set overlaps what's already gathered; the local node signs its
    /// own contribution first if it hasn't yet (§4.5).
    pub async fn add_bitcoin_signatures(
        &self,
        batch: &mut TransferBatch,
        contributed_psbts: Vec<bitcoin::psbt::Psbt>,
    ) -> Result<bool> {
        let required = self.num_required_signers();
        if batch.has_enough_bitcoin_signatures(required) {
            return Ok(false);
        }

        let mut base = batch.signed_psbt.clone().unwrap_or_else(|| batch.initial_psbt.clone());
        let own_already_signed = base.inputs.iter().all(|i| !i.partial_sigs.is_empty());
        if !own_already_signed {
            base = self.bitcoin.sign(&base).await?;
        }

        let mut changed = !own_already_signed;
        for contribution in contributed_psbts {
            if contribution.inputs.iter().all(|i| i.partial_sigs.is_empty()) {
                continue;
            }
            base = self.bitcoin.combine(&[base, contribution])?;
            changed = true;
        }

        if changed {
            batch.signed_psbt = Some(base);
        }
        Ok(changed)
    }

    /// Precondition: enough sending signatures, not already marked (§4.5).
    pub async fn mark_as_sending_in_chain(&self, batch: &mut TransferBatch) -> Result<()> {
        let required = self.num_required_signers();
        if !batch.has_enough_sending_signatures(required) {
            return Err(Error::validation("insufficient sending signatures to mark as sending"));
        }
        let view = self
            .chain
            .get_transfer(&batch.transfers[0].btc_address, batch.transfers[0].nonce, None)
            .await?;
        if view.status != TransferStatus::New {
            return Ok(()); // already marked; idempotent no-op (§5).
        }

        let signatures: Vec<(Address, Signature)> = batch
            .sending_signers
            .iter()
            .copied()
            .zip(batch.sending_signatures.iter().copied())
            .collect();
        self.chain
            .mark_as_sending(batch.bitcoin_tx_hash, &batch.transfer_ids(), &signatures)
            .await?;
        self.store.update_transfer_status(batch.transfer_ids(), TransferStatus::Sending).await?;
        Ok(())
    }

    /// Analogous to [`Self::mark_as_sending_in_chain`] with mined signatures (§4.5).
    pub async fn mark_as_mined_in_chain(&self, batch: &mut TransferBatch) -> Result<()> {
        let required = self.num_required_signers();
        if !batch.has_enough_mined_signatures(required) {
            return Err(Error::validation("insufficient mined signatures to mark as mined"));
        }
        let view = self
            .chain
            .get_transfer(&batch.transfers[0].btc_address, batch.transfers[0].nonce, None)
            .await?;
        if view.status == TransferStatus::Mined {
            return Ok(());
        }

        let signatures: Vec<(Address, Signature)> = batch
            .mined_signers
            .iter()
            .copied()
            .zip(batch.mined_signatures.iter().copied())
            .collect();
        self.chain.mark_as_mined(&batch.transfer_ids(), &signatures).await?;
        self.store.update_transfer_status(batch.transfer_ids(), TransferStatus::Mined).await?;
        Ok(())
    }

    /// Validator must pass `validate_for_sending_to_bitcoin`; a no-op if
    /// already confirmed (§4.5, §5 idempotence).
    pub async fn send_to_bitcoin(&self, batch: &TransferBatch) -> Result<()> {
        validator::validate_for_sending_to_bitcoin(
            batch,
            self.chain.as_ref(),
            self.bitcoin.as_ref(),
            self.durable_confirmations(),
            self.num_required_signers(),
        )
        .await?;

        let psbt = batch
            .signed_psbt
            .as_ref()
            .ok_or_else(|| Error::validation("batch has no signed psbt"))?;
        let txid = psbt.unsigned_tx.compute_txid();
        if let Some(confirmations) = self.bitcoin.get_tx(&txid).await? {
            if confirmations >= 1 {
                return Ok(());
            }
        }
        self.bitcoin.submit(psbt).await?;
        Ok(())
    }

    /// Runs `validate_for_signing_sending_update`, then returns the local
    /// node's `(address, signature)` over the sending update hash (§4.5).
    pub async fn sign_sending_update(&self, batch: &TransferBatch) -> Result<(Address, Signature)> {
        validator::validate_for_signing_sending_update(
            batch,
            self.chain.as_ref(),
            self.bitcoin.as_ref(),
            self.durable_confirmations(),
        )
        .await?;
        let update_hash = self
            .chain
            .get_update_hash_for_sending(batch.bitcoin_tx_hash, &batch.transfer_ids())
            .await?;
        let signature = self.chain.sign_message(update_hash.as_bytes()).await?;
        Ok((self.chain.own_address(), signature))
    }

    /// Runs `validate_for_signing_mined_update`, then returns the local
    /// node's `(address, signature)` over the mined update hash (§4.5).
    pub async fn sign_mined_update(&self, batch: &TransferBatch) -> Result<(Address, Signature)> {
        validator::validate_for_signing_mined_update(
            batch,
            self.chain.as_ref(),
            self.bitcoin.as_ref(),
            self.durable_confirmations(),
            self.num_required_signers(),
        )
        .await?;
        let update_hash = self.chain.get_update_hash_for_mined(&batch.transfer_ids()).await?;
        let signature = self.chain.sign_message(update_hash.as_bytes()).await?;
        Ok((self.chain.own_address(), signature))
    }
}
