//! The node loop (C8, §4.8): the single-threaded cooperative driver that
//! ties every other component together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Signature};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::batch_service::BatchService;
use crate::bitcoin::BitcoinAdapter;
use crate::chain::ChainAdapter;
use crate::config::{BatchConfig, BitcoinConfig};
use crate::domain::batch::{decode_psbt, encode_psbt, parse_signature, TransferBatch};
use crate::domain::transfer::TransferId;
use crate::error::{exit_code, Error, Result};
use crate::initiator::InitiatorVoter;
use crate::monitoring::{names, Metrics};
use crate::p2p::{Message, NodeEvent, P2pGroup};
use crate::replenisher::Replenisher;
use crate::store::BatchStore;

/// Scratch state owned by the initiator only; cleared whenever a reply
/// arrives for a batch whose id list no longer matches the current batch (§4.8).
#[derive(Default)]
struct Scratch {
    batch_ids: Vec<TransferId>,
    gathered_sending: Vec<(Address, Signature)>,
    gathered_mined: Vec<(Address, Signature)>,
    gathered_bitcoin_psbts: Vec<bitcoin::psbt::Psbt>,
    replenish_psbt_txid: Option<bitcoin::Txid>,
    gathered_replenish_psbts: Vec<bitcoin::psbt::Psbt>,
}

impl Scratch {
    fn reset_for(&mut self, batch_ids: Vec<TransferId>) {
        if self.batch_ids != batch_ids {
            self.batch_ids = batch_ids;
            self.gathered_sending.clear();
            self.gathered_mined.clear();
            self.gathered_bitcoin_psbts.clear();
        }
    }

    /// Replenishment rounds aren't tied to batch identity, so they keep their
    /// own scratch lifecycle: gathered contributions are dropped only when the
    /// PSBT being signed actually changes (§4.9).
    fn reset_replenish_for(&mut self, txid: bitcoin::Txid) {
        if self.replenish_psbt_txid != Some(txid) {
            self.replenish_psbt_txid = Some(txid);
            self.gathered_replenish_psbts.clear();
        }
    }
}

pub struct NodeLoop {
    chain: Arc<dyn ChainAdapter>,
    bitcoin: Arc<dyn BitcoinAdapter>,
    store: Arc<BatchStore>,
    batch_service: Arc<BatchService>,
    p2p: P2pGroup,
    initiator: Mutex<InitiatorVoter>,
    replenisher: Replenisher,
    metrics: Arc<Metrics>,
    batch_config: BatchConfig,
    bitcoin_config: BitcoinConfig,
    scratch: Mutex<Scratch>,
    last_scanned_block: AtomicU64,
    own_node_id: String,
    cancellation: CancellationToken,
}

impl NodeLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainAdapter>,
        bitcoin: Arc<dyn BitcoinAdapter>,
        store: Arc<BatchStore>,
        batch_service: Arc<BatchService>,
        p2p: P2pGroup,
        replenisher: Replenisher,
        metrics: Arc<Metrics>,
        batch_config: BatchConfig,
        bitcoin_config: BitcoinConfig,
        start_block: u64,
        cancellation: CancellationToken,
    ) -> Self {
        let own_node_id = format!("{:#x}", chain.own_address());
        Self {
            chain,
            bitcoin,
            store,
            batch_service,
            p2p,
            initiator: Mutex::new(InitiatorVoter::new(own_node_id.clone())),
            replenisher,
            metrics,
            batch_config,
            bitcoin_config,
            scratch: Mutex::new(Scratch::default()),
            last_scanned_block: AtomicU64::new(start_block),
            own_node_id,
            cancellation,
        }
    }

    /// The 10 s-cadence main loop (§4.8). Runs until the cancellation token
    /// fires or the node's federator role is revoked.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.cancellation.is_cancelled() {
                return Ok(());
            }

            self.drain_inbound_messages().await;

            if let Err(e) = self.run_iteration().await {
                if matches!(e.kind(), crate::error::ErrorKind::Fatal) {
                    tracing::error!(error = %e, "fatal error, exiting");
                    return Err(e);
                }
                self.metrics.incr(names::ITERATION_ERRORS);
                tracing::warn!(error = %e, "iteration failed; will retry next tick");
            } else {
                self.metrics.incr(names::ITERATIONS_COMPLETED);
            }

            if !self.check_still_federator().await? {
                return Err(Error::RoleLost);
            }

            match self.replenisher.run_once().await {
                Ok(Some(psbt)) => {
                    if let Err(e) = self.drive_replenishment(psbt).await {
                        tracing::warn!(error = %e, "replenishment signature round failed");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "replenisher iteration failed"),
            }

            self.sleep_respecting_cancellation(self.batch_config.iteration_interval).await;
        }
    }

    async fn sleep_respecting_cancellation(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancellation.cancelled() => {}
        }
    }

    async fn check_still_federator(&self) -> Result<bool> {
        let federators = self.chain.federators().await?;
        Ok(federators.contains(&self.chain.own_address()))
    }

    /// Drain whatever p2p messages have arrived since the last tick; routes
    /// each to the initiator-scratch collector or the request-answering
    /// path depending on this node's current role (§4.8).
    async fn drain_inbound_messages(&mut self) {
        while let Ok((peer_id, envelope)) = self.p2p.inbound.try_recv() {
            let is_initiator = self.initiator.lock().is_initiator();
            if is_initiator {
                self.handle_response_as_initiator(envelope.data);
            } else {
                let current_pick = self.initiator.lock().current_pick().map(str::to_string);
                if let Some(pick) = &current_pick {
                    if &envelope.source_node_id != pick && !matches!(envelope.data, Message::InitiatorSyncRequest { .. } | Message::InitiatorSyncResponse { .. }) {
                        continue; // non-initiators ignore requests from a non-agreed initiator (§4.8).
                    }
                }
                if let Err(e) = self.answer_as_non_initiator(&peer_id, envelope.data).await {
                    tracing::debug!(error = %e, "declined to answer peer request");
                }
            }
        }

        while let Ok(event) = self.p2p.events.try_recv() {
            match event {
                NodeEvent::Available(_) => {}
                NodeEvent::Unavailable(peer_id) => self.initiator.lock().on_node_unavailable(&peer_id),
            }
        }
    }

    fn handle_response_as_initiator(&self, message: Message) {
        let mut scratch = self.scratch.lock();
        match message {
            Message::SendingSignatureResponse { dto, address, signature } => {
                if dto.transfer_ids() != scratch.batch_ids {
                    return;
                }
                if let Ok(sig) = parse_signature(&signature) {
                    scratch.gathered_sending.push((address, sig));
                }
            }
            Message::MinedSignatureResponse { dto, address, signature } => {
                if dto.transfer_ids() != scratch.batch_ids {
                    return;
                }
                if let Ok(sig) = parse_signature(&signature) {
                    scratch.gathered_mined.push((address, sig));
                }
            }
            Message::BitcoinSignatureResponse { dto, signed_psbt } => {
                if dto.transfer_ids() != scratch.batch_ids {
                    return;
                }
                if let Ok(psbt) = decode_psbt(&signed_psbt) {
                    scratch.gathered_bitcoin_psbts.push(psbt);
                }
            }
            Message::InitiatorSyncRequest { initiator_id } | Message::InitiatorSyncResponse { initiator_id } => {
                drop(scratch);
                self.initiator.lock().record_report(initiator_id.clone(), initiator_id);
            }
            Message::ReplenishSignatureResponse { psbt } => {
                if let Ok(decoded) = decode_psbt(&psbt) {
                    if Some(decoded.unsigned_tx.compute_txid()) == scratch.replenish_psbt_txid {
                        scratch.gathered_replenish_psbts.push(decoded);
                    }
                }
            }
            _ => {}
        }
    }

    /// Answer each `request-*` by running the matching validator and
    /// returning a signed artefact only if validation passes (§4.8).
    async fn answer_as_non_initiator(&self, peer_id: &str, message: Message) -> Result<()> {
        match message {
            Message::RequestSendingSignature { dto } => {
                let batch = TransferBatch::from_dto(dto.clone())?;
                let (address, signature) = self.batch_service.sign_sending_update(&batch).await?;
                self.p2p.send_to(
                    peer_id,
                    &self.own_node_id,
                    Message::SendingSignatureResponse { dto, address, signature: signature.to_string() },
                );
            }
            Message::RequestMinedSignature { dto } => {
                let batch = TransferBatch::from_dto(dto.clone())?;
                let (address, signature) = self.batch_service.sign_mined_update(&batch).await?;
                self.p2p.send_to(
                    peer_id,
                    &self.own_node_id,
                    Message::MinedSignatureResponse { dto, address, signature: signature.to_string() },
                );
            }
            Message::RequestBitcoinSignature { dto } => {
                let batch = TransferBatch::from_dto(dto.clone())?;
                let signed = self.bitcoin.sign(&batch.initial_psbt).await?;
                self.p2p.send_to(
                    peer_id,
                    &self.own_node_id,
                    Message::BitcoinSignatureResponse { dto, signed_psbt: encode_psbt(&signed) },
                );
            }
            Message::InitiatorSyncRequest { initiator_id } => {
                self.initiator.lock().record_report(peer_id.to_string(), initiator_id);
                let pick = self.initiator.lock().current_pick().unwrap_or(&self.own_node_id).to_string();
                self.p2p.send_to(peer_id, &self.own_node_id, Message::InitiatorSyncResponse { initiator_id: pick });
            }
            Message::RequestReplenishSignature { psbt, .. } => {
                let decoded = decode_psbt(&psbt)?;
                self.replenisher.validate_replenishment_psbt(&decoded)?;
                let signed = self.replenisher.sign_contribution(&decoded).await?;
                self.p2p.send_to(
                    peer_id,
                    &self.own_node_id,
                    Message::ReplenishSignatureResponse { psbt: encode_psbt(&signed) },
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Mirrors the main batch's Bitcoin signature flow (§4.5) for the
    /// replenishment PSBT `run_once` just built: gather peer contributions,
    /// combine, and submit once enough signatures are present (§4.9).
    async fn drive_replenishment(&self, own_psbt: bitcoin::psbt::Psbt) -> Result<()> {
        if !self.initiator.lock().is_initiator() {
            return Ok(());
        }
        if self.replenisher.already_broadcast(&own_psbt).await? {
            return Ok(());
        }

        let txid = own_psbt.unsigned_tx.compute_txid();
        let gathered = {
            let mut scratch = self.scratch.lock();
            scratch.reset_replenish_for(txid);
            std::mem::take(&mut scratch.gathered_replenish_psbts)
        };

        let mut combined = own_psbt;
        for contribution in gathered {
            if contribution.unsigned_tx.compute_txid() != txid {
                continue;
            }
            combined = self.replenisher.combine(&[combined, contribution])?;
        }

        let required = self.bitcoin_config.num_required_signers;
        if self.replenisher.has_enough_signatures(&combined, required) {
            let broadcast_txid = self.replenisher.submit(&combined).await?;
            tracing::info!(txid = %broadcast_txid, "replenishment transaction broadcast");
            return Ok(());
        }

        let (period_index, times_in_period) = self.replenisher.rate_limit_progress();
        self.p2p.broadcast(
            &self.own_node_id,
            Message::RequestReplenishSignature {
                psbt: encode_psbt(&combined),
                period_index,
                times_in_period,
            },
        );
        Ok(())
    }

    /// The 11-step initiator path (§4.8).
    async fn run_iteration(&self) -> Result<()> {
        self.scan_new_events().await?;

        let federators = self.chain.federators().await?;
        let known_node_ids: Vec<String> = federators.iter().map(|a| format!("{a:#x}")).collect();
        let pick = self.initiator.lock().re_elect(&known_node_ids);
        self.p2p.broadcast(&self.own_node_id, Message::InitiatorSyncRequest { initiator_id: pick });

        if !self.initiator.lock().is_initiator() {
            return Ok(());
        }

        if self.p2p.pool.known_peers().len() + 1 < self.bitcoin_config.num_required_signers {
            return Ok(()); // step 2: not enough live nodes to reach M.
        }

        let mut batch = match self.batch_service.get_current_batch().await? {
            Some(b) => b,
            None => return Ok(()),
        };

        self.metrics.set_gauge(names::BATCH_SIZE, batch.transfers.len() as i64);
        self.scratch.lock().reset_for(batch.identity());

        let gathered_sending = std::mem::take(&mut self.scratch.lock().gathered_sending);
        let gathered_mined = std::mem::take(&mut self.scratch.lock().gathered_mined);
        let gathered_psbts = std::mem::take(&mut self.scratch.lock().gathered_bitcoin_psbts);

        let mut changed = self.batch_service.add_sending_signatures(&mut batch, gathered_sending).await?;
        changed |= self.batch_service.add_mined_signatures(&mut batch, gathered_mined).await?;
        changed |= self.batch_service.add_bitcoin_signatures(&mut batch, gathered_psbts).await?;

        if !self.batch_service.is_due(&batch).await? {
            return Ok(());
        }

        let now = now_unix();
        self.batch_service.persist_if_due(&batch, now).await?;
        if changed {
            self.batch_service.persist_if_due(&batch, now).await?;
        }

        let required = self.bitcoin_config.num_required_signers;
        self.metrics.set_gauge(names::SENDING_SIGNATURES_GATHERED_GAUGE, batch.sending_signatures.len() as i64);

        if !batch.has_enough_sending_signatures(required) {
            self.p2p.broadcast(&self.own_node_id, Message::RequestSendingSignature { dto: batch.to_dto()? });
            return Ok(());
        }

        let sending_view = self.chain.get_transfer(&batch.transfers[0].btc_address, batch.transfers[0].nonce, None).await?;
        if sending_view.status == crate::domain::transfer::TransferStatus::New {
            self.batch_service.mark_as_sending_in_chain(&mut batch).await?;
            return Ok(());
        }

        if !batch.has_enough_bitcoin_signatures(required) {
            self.p2p.broadcast(&self.own_node_id, Message::RequestBitcoinSignature { dto: batch.to_dto()? });
            return Ok(());
        }

        let txid = batch.signed_psbt.as_ref().unwrap_or(&batch.initial_psbt).unsigned_tx.compute_txid();
        if self.bitcoin.get_tx(&txid).await?.is_none() {
            self.batch_service.send_to_bitcoin(&batch).await?;
            return Ok(());
        }

        if !batch.has_enough_mined_signatures(required) {
            self.p2p.broadcast(&self.own_node_id, Message::RequestMinedSignature { dto: batch.to_dto()? });
            return Ok(());
        }

        let mined_view = self.chain.get_transfer(&batch.transfers[0].btc_address, batch.transfers[0].nonce, None).await?;
        if mined_view.status != crate::domain::transfer::TransferStatus::Mined {
            self.batch_service.mark_as_mined_in_chain(&mut batch).await?;
        }

        Ok(())
    }

    async fn scan_new_events(&self) -> Result<()> {
        let current_block = self.chain.current_block().await?;
        let from_block = self.last_scanned_block.load(Ordering::Relaxed);
        if current_block <= from_block {
            return Ok(());
        }
        let events = self.chain.scan_events(from_block + 1, current_block).await?;

        let mut new_transfers = Vec::new();
        let mut status_updates: Vec<(TransferId, crate::domain::transfer::TransferStatus)> = Vec::new();
        for event in events {
            match event {
                crate::chain::ChainEvent::NewTransfer {
                    transfer_id: _,
                    btc_address,
                    nonce,
                    total_amount_sat,
                    origin_address,
                    origin_tx_hash,
                    origin_log_index,
                    origin_block_number,
                } => {
                    if let Ok(transfer) = crate::domain::transfer::Transfer::new(
                        btc_address,
                        nonce,
                        total_amount_sat,
                        origin_address,
                        origin_tx_hash,
                        origin_log_index,
                        origin_block_number,
                    ) {
                        new_transfers.push(transfer);
                    }
                }
                crate::chain::ChainEvent::StatusUpdated { transfer_id, status } => {
                    status_updates.push((transfer_id, status));
                }
            }
        }

        if !new_transfers.is_empty() {
            self.store.insert_new_transfers(new_transfers).await?;
        }
        for (id, status) in status_updates {
            self.store.update_transfer_status(vec![id], status).await?;
        }

        self.last_scanned_block.store(current_block, Ordering::Relaxed);
        Ok(())
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub mod names_ext {
    pub const SENDING_SIGNATURES_GATHERED_GAUGE: &str = "sending_signatures_gathered_gauge";
}
pub use names_ext::SENDING_SIGNATURES_GATHERED_GAUGE;

/// Distinct process exit codes the binary maps iteration-loop outcomes to (§6).
pub fn exit_code_for(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => exit_code::CLEAN_SHUTDOWN,
        Err(Error::RoleLost) => exit_code::LOST_FEDERATOR_ROLE,
        Err(_) => exit_code::BITCOIN_HEALTH_CHECK_FAILED,
    }
}
