//! The Bitcoin adapter (C2, §4.2): builds, combines, and submits PSBTs for
//! the M-of-N P2WSH payout address, and answers queries about its UTXOs and
//! transaction state.

pub mod address;
pub mod adapter;
pub mod fee;
pub mod fixtures;
pub mod psbt;
pub mod rpc;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use bitcoin::{Address as BtcAddress, Amount, Txid};
use ethers::types::H256;

use crate::domain::transfer::Transfer;
use crate::error::{Error, Result};

pub use address::MultisigAddress;
pub use adapter::RpcBitcoinAdapter;
pub use rpc::BitcoinRpcClient;

/// What the rest of the core needs from "a Bitcoin full node plus a PSBT
/// library" (§1 deliberately-out-of-scope collaborators; §4.2 operations).
#[async_trait]
pub trait BitcoinAdapter: Send + Sync {
    /// Build an unsigned PSBT paying each transfer, funded from the
    /// multisig's own UTXOs. `no_change = true` is used only by the
    /// replenisher (§4.9), where the single output absorbs all remaining
    /// value after fees.
    async fn create_partial_tx(
        &self,
        transfers: &[Transfer],
        sign_self: bool,
        no_change: bool,
        max_inputs: Option<usize>,
    ) -> Result<Psbt>;

    /// Add this node's own signature(s) to `psbt`.
    async fn sign(&self, psbt: &Psbt) -> Result<Psbt>;

    /// Merge partial signatures from multiple contributors into one PSBT.
    fn combine(&self, psbts: &[Psbt]) -> Result<Psbt>;

    /// Broadcast the fully-signed transaction extracted from `psbt`.
    async fn submit(&self, psbt: &Psbt) -> Result<Txid>;

    /// `None` if the transaction is unknown to the node; `Some(confirmations)` otherwise.
    async fn get_tx(&self, txid: &Txid) -> Result<Option<u32>>;

    /// Recover the ordered list of transfers a PSBT pays, by reading its
    /// OP_RETURN nonce payload and payment outputs.
    fn get_transfers_from(&self, psbt: &Psbt) -> Result<Vec<(BtcAddress, u8, Amount)>>;

    /// Current confirmed balance of the multisig address.
    async fn multisig_balance(&self, change_only: bool) -> Result<Amount>;

    fn validate_address(&self, addr: &str) -> bool;

    /// The Bitcoin transaction hash computed from the *unsigned* PSBT (§4.2.1).
    fn early_tx_hash(&self, psbt: &Psbt) -> Result<H256>;

    fn canonical_address(&self) -> &MultisigAddress;
}

/// Sanity-checks the early-tx-hash invariant (§4.2.1, §9): subsequent
/// signatures must never change the txid of a segwit PSBT. Run once at
/// startup; if it fails the node refuses to start (fatal, §7).
///
/// Actually signs and finalizes the fixture PSBT with its own keys, since
/// only a finalized transaction's witness can move (or fail to move) a
/// txid — an unsigned `Transaction` never carries one to begin with.
pub fn assert_early_tx_hash_invariant() -> Result<()> {
    use std::str::FromStr;

    use bitcoin::bip32::{ChildNumber, DerivationPath};
    use bitcoin::ecdsa::Signature as EcdsaSignature;
    use bitcoin::secp256k1::{Message, Secp256k1};
    use bitcoin::sighash::{EcdsaSighashType, SighashCache};
    use bitcoin::{PublicKey, Witness};

    use crate::bitcoin::adapter::extract_pubkeys;
    use crate::bitcoin::fixtures::{fixture_signing_material, signable_sample_psbt};

    let (xprivs, multisig) = fixture_signing_material();
    let psbt = signable_sample_psbt(&multisig);
    let unsigned_txid = psbt.unsigned_tx.compute_txid();

    // Non-segwit inputs carry no witness_utxo/witness_script and cannot
    // participate in this check at all (§4.2.1).
    for (i, input) in psbt.inputs.iter().enumerate() {
        if input.witness_utxo.is_none() || input.witness_script.is_none() {
            return Err(Error::StartupCheck(format!(
                "early-tx-hash fixture input {i} is not segwit: non-segwit inputs are rejected"
            )));
        }
    }

    let secp = Secp256k1::new();
    let path = DerivationPath::from_str("m/0").expect("fixture path is valid");
    let children: Vec<ChildNumber> = path.as_ref().to_vec();

    let mut signed = psbt.clone();
    let unsigned_tx = signed.unsigned_tx.clone();
    let mut cache = SighashCache::new(&unsigned_tx);
    for i in 0..signed.inputs.len() {
        let witness_script = signed.inputs[i]
            .witness_script
            .clone()
            .ok_or_else(|| Error::StartupCheck(format!("fixture input {i} missing witness_script")))?;
        let witness_utxo = signed.inputs[i]
            .witness_utxo
            .clone()
            .ok_or_else(|| Error::StartupCheck(format!("fixture input {i} missing witness_utxo")))?;
        let sighash = cache
            .p2wsh_signature_hash(i, &witness_script, witness_utxo.value, EcdsaSighashType::All)
            .map_err(|e| Error::StartupCheck(format!("fixture sighash failed for input {i}: {e}")))?;
        let message = Message::from_digest(sighash.to_byte_array());

        for xpriv in &xprivs {
            if signed.inputs[i].partial_sigs.len() >= multisig.required_signers {
                break;
            }
            let derived = xpriv
                .derive_priv(&secp, &children)
                .map_err(|e| Error::StartupCheck(format!("fixture key derivation failed: {e}")))?;
            let public_key = PublicKey::new(derived.private_key.public_key(&secp));
            let signature = secp.sign_ecdsa(&message, &derived.private_key);
            signed.inputs[i].partial_sigs.insert(
                public_key,
                EcdsaSignature { signature, sighash_type: EcdsaSighashType::All },
            );
        }
    }

    for input in signed.inputs.iter_mut() {
        let witness_script = input
            .witness_script
            .clone()
            .ok_or_else(|| Error::StartupCheck("fixture input missing witness_script at finalization".into()))?;
        let ordered_pubkeys = extract_pubkeys(&witness_script)?;
        let mut stack: Vec<Vec<u8>> = vec![Vec::new()];
        for pk in &ordered_pubkeys {
            if let Some(sig) = input.partial_sigs.get(pk) {
                stack.push(sig.to_vec());
                if stack.len() - 1 >= multisig.required_signers {
                    break;
                }
            }
        }
        stack.push(witness_script.to_bytes());
        input.final_script_witness = Some(Witness::from_slice(&stack));
        input.partial_sigs.clear();
        input.witness_script = None;
    }

    let finalized_tx = signed
        .extract_tx()
        .map_err(|e| Error::StartupCheck(format!("fixture tx extraction failed: {e}")))?;
    let signed_txid = finalized_tx.compute_txid();

    if unsigned_txid != signed_txid {
        return Err(Error::StartupCheck(
            "early-tx-hash invariant violated: signing changed the txid".into(),
        ));
    }
    Ok(())
}
