//! The batch validator (C4, §4.4): pure validation, run before every state
//! transition and before accepting any peer-provided artefact. Nothing here
//! performs I/O beyond what its chain/bitcoin adapter arguments already
//! provide; a validator failure is always [`crate::error::ErrorKind::Validation`],
//! never a crash.

use std::collections::HashSet;

use ethers::types::{Address, Signature};

use crate::bitcoin::BitcoinAdapter;
use crate::chain::{ChainAdapter, TransferView};
use crate::crypto::eip191;
use crate::domain::batch::TransferBatch;
use crate::domain::transfer::TransferStatus;
use crate::error::{Error, Result};

/// Verify `(addr, sig)` pairs recover the expected `message` and every
/// signer is a current federator with no duplicates (§4.4 "Signature validation").
pub fn validate_signatures(
    message: &[u8],
    signers: &[Address],
    signatures: &[Signature],
    federators: &HashSet<Address>,
) -> Result<()> {
    if signers.len() != signatures.len() {
        return Err(Error::validation("signers and signatures arrays have unequal length"));
    }
    let mut seen = HashSet::new();
    for (addr, sig) in signers.iter().zip(signatures.iter()) {
        if !federators.contains(addr) {
            return Err(Error::validation(format!("{addr:#x} is not a current federator")));
        }
        if !seen.insert(*addr) {
            return Err(Error::validation(format!("duplicate signer {addr:#x}")));
        }
        let recovered = eip191::recover_address(message, sig)?;
        if recovered != *addr {
            return Err(Error::validation(format!(
                "signature does not recover to claimed signer {addr:#x} (recovered {recovered:#x})"
            )));
        }
    }
    Ok(())
}

/// `get_transfers_from(psbt)` must yield exactly the batch's transfers, in
/// `(address, nonce)` order; the change output (if any) must pay the
/// canonical multisig; `early_tx_hash` must match the batch's stored hash
/// (§4.4 "PSBT validation").
pub fn validate_psbt_matches_batch(batch: &TransferBatch, bitcoin: &dyn BitcoinAdapter) -> Result<()> {
    let mut expected: Vec<(String, u8)> = batch
        .transfers
        .iter()
        .map(|t| (t.btc_address.to_lowercase(), t.nonce))
        .collect();
    expected.sort();

    let psbt_transfers = bitcoin.get_transfers_from(&batch.initial_psbt)?;
    let mut actual: Vec<(String, u8)> = psbt_transfers
        .iter()
        .map(|(addr, nonce, _amount)| (addr.to_string().to_lowercase(), *nonce))
        .collect();
    actual.sort();

    if expected != actual {
        return Err(Error::validation("psbt payments do not match the batch's transfers"));
    }

    let outputs = &batch.initial_psbt.unsigned_tx.output;
    if outputs.len() > batch.transfers.len() + 1 {
        let change_output = &outputs[batch.transfers.len() + 1];
        if change_output.script_pubkey != bitcoin.canonical_address().address.script_pubkey() {
            return Err(Error::validation("change output does not pay the canonical multisig address"));
        }
    }

    let computed_hash = bitcoin.early_tx_hash(&batch.initial_psbt)?;
    if computed_hash != batch.bitcoin_tx_hash {
        return Err(Error::validation("early tx hash does not match the batch's stored hash"));
    }
    Ok(())
}

fn validate_transfers_nonempty(batch: &TransferBatch) -> Result<()> {
    if batch.transfers.is_empty() {
        return Err(Error::validation("batch has no transfers"));
    }
    Ok(())
}

async fn validate_amount_stable(
    batch: &TransferBatch,
    chain: &dyn ChainAdapter,
    durable_confirmations: u64,
) -> Result<()> {
    let current_block = chain.current_block().await?;
    let historical_block = current_block.saturating_sub(durable_confirmations);
    for transfer in &batch.transfers {
        let current: TransferView = chain.get_transfer(&transfer.btc_address, transfer.nonce, None).await?;
        let historical: TransferView = chain
            .get_transfer(&transfer.btc_address, transfer.nonce, Some(historical_block))
            .await?;
        if current.total_amount_sat != transfer.total_amount_sat || historical.total_amount_sat != transfer.total_amount_sat {
            return Err(Error::validation(format!(
                "transfer {} amount is not stable across confirmations",
                transfer.transfer_id
            )));
        }
    }
    Ok(())
}

async fn validate_all_transfers_have_status(
    batch: &TransferBatch,
    chain: &dyn ChainAdapter,
    expected: TransferStatus,
) -> Result<()> {
    for transfer in &batch.transfers {
        let view = chain.get_transfer(&transfer.btc_address, transfer.nonce, None).await?;
        if view.status != expected {
            return Err(Error::validation(format!(
                "transfer {} has chain status {:?}, expected {:?}",
                transfer.transfer_id, view.status, expected
            )));
        }
    }
    Ok(())
}

/// Entry point 1: require `transfers.len > 0`; every transfer's current
/// chain status is `New`; PSBT is well-formed and matches; amounts stable
/// across confirmations (§4.4).
pub async fn validate_for_signing_sending_update(
    batch: &TransferBatch,
    chain: &dyn ChainAdapter,
    bitcoin: &dyn BitcoinAdapter,
    durable_confirmations: u64,
) -> Result<()> {
    validate_transfers_nonempty(batch)?;
    validate_all_transfers_have_status(batch, chain, TransferStatus::New).await?;
    validate_psbt_matches_batch(batch, bitcoin)?;
    validate_amount_stable(batch, chain, durable_confirmations).await?;
    Ok(())
}

/// Entry point 2: above, plus `sending_signatures.len ≥ num_required_signers`
/// and chain status is `Sending` (§4.4).
pub async fn validate_for_signing_bitcoin_tx(
    batch: &TransferBatch,
    chain: &dyn ChainAdapter,
    bitcoin: &dyn BitcoinAdapter,
    durable_confirmations: u64,
    num_required_signers: usize,
) -> Result<()> {
    validate_transfers_nonempty(batch)?;
    validate_psbt_matches_batch(batch, bitcoin)?;
    validate_amount_stable(batch, chain, durable_confirmations).await?;
    if !batch.has_enough_sending_signatures(num_required_signers) {
        return Err(Error::validation("insufficient sending signatures"));
    }
    validate_all_transfers_have_status(batch, chain, TransferStatus::Sending).await?;
    Ok(())
}

/// Entry point 3: above, plus a signed PSBT with ≥ M signatures and the batch
/// is already marked as `Sending` on-chain (§4.4).
pub async fn validate_for_sending_to_bitcoin(
    batch: &TransferBatch,
    chain: &dyn ChainAdapter,
    bitcoin: &dyn BitcoinAdapter,
    durable_confirmations: u64,
    num_required_signers: usize,
) -> Result<()> {
    validate_for_signing_bitcoin_tx(batch, chain, bitcoin, durable_confirmations, num_required_signers).await?;
    if !batch.has_enough_bitcoin_signatures(num_required_signers) {
        return Err(Error::validation("insufficient bitcoin signatures"));
    }
    Ok(())
}

/// Entry point 4: above, plus the Bitcoin transaction is confirmed ≥ 1 block
/// and chain status is still `Sending` (§4.4).
pub async fn validate_for_signing_mined_update(
    batch: &TransferBatch,
    chain: &dyn ChainAdapter,
    bitcoin: &dyn BitcoinAdapter,
    durable_confirmations: u64,
    num_required_signers: usize,
) -> Result<()> {
    validate_for_sending_to_bitcoin(batch, chain, bitcoin, durable_confirmations, num_required_signers).await?;
    let txid = batch
        .signed_psbt
        .as_ref()
        .unwrap_or(&batch.initial_psbt)
        .unsigned_tx
        .compute_txid();
    let confirmations = bitcoin.get_tx(&txid).await?.unwrap_or(0);
    if confirmations < 1 {
        return Err(Error::validation("bitcoin transaction is not yet confirmed"));
    }
    Ok(())
}

/// Entry point 5: all of the above, terminal-ready (§4.4).
pub async fn validate_complete(
    batch: &TransferBatch,
    chain: &dyn ChainAdapter,
    bitcoin: &dyn BitcoinAdapter,
    durable_confirmations: u64,
    num_required_signers: usize,
) -> Result<()> {
    validate_for_signing_mined_update(batch, chain, bitcoin, durable_confirmations, num_required_signers).await?;
    if !batch.has_enough_mined_signatures(num_required_signers) {
        return Err(Error::validation("insufficient mined signatures"));
    }
    validate_all_transfers_have_status(batch, chain, TransferStatus::Sending).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unequal_signer_and_signature_lengths() {
        let federators = HashSet::new();
        let result = validate_signatures(b"msg", &[Address::zero()], &[], &federators);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_federator_signer() {
        use ethers::signers::{LocalWallet, Signer};
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let message = b"update-hash";
        let signature = futures::executor::block_on(eip191::sign_message(&wallet, message)).unwrap();
        let federators = HashSet::new();
        let result = validate_signatures(message, &[wallet.address()], &[signature], &federators);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_valid_federator_signature() {
        use ethers::signers::{LocalWallet, Signer};
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let message = b"update-hash";
        let signature = futures::executor::block_on(eip191::sign_message(&wallet, message)).unwrap();
        let mut federators = HashSet::new();
        federators.insert(wallet.address());
        let result = validate_signatures(message, &[wallet.address()], &[signature], &federators);
        assert!(result.is_ok());
    }
}
