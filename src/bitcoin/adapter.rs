//! `RpcBitcoinAdapter`: the concrete [`BitcoinAdapter`] that wires a JSON-RPC
//! client, the derived multisig address, and this node's Bitcoin signing key
//! together (§4.2).

use std::collections::HashMap;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address as BtcAddress, Amount, Network, PublicKey, Txid, Witness};
use ethers::types::H256;
use serde_json::Value;

use crate::bitcoin::address::MultisigAddress;
use crate::bitcoin::fee::{apply_safety_margin, REGTEST_FEE_RATE_SAT_VB};
use crate::bitcoin::psbt::{build_unsigned_psbt, read_op_return_nonces, BuildPsbtParams, Utxo};
use crate::bitcoin::rpc::BitcoinRpcClient;
use crate::bitcoin::BitcoinAdapter;
use crate::crypto::keystore::FederatorKeystore;
use crate::domain::transfer::Transfer;
use crate::error::{Error, Result};

pub struct RpcBitcoinAdapter {
    rpc: BitcoinRpcClient,
    multisig: MultisigAddress,
    derivation_path: DerivationPath,
    xpriv: Xpriv,
    network: Network,
    last_fee_rate: parking_lot::Mutex<u64>,
}

impl RpcBitcoinAdapter {
    pub fn new(
        rpc: BitcoinRpcClient,
        multisig: MultisigAddress,
        derivation_path: &str,
        keystore: &FederatorKeystore,
        network: Network,
    ) -> Result<Self> {
        let derivation_path = DerivationPath::from_str(derivation_path)
            .map_err(|e| Error::Config(format!("invalid derivation path {derivation_path}: {e}")))?;
        Ok(Self {
            rpc,
            multisig,
            derivation_path,
            xpriv: *keystore.bitcoin_xpriv(),
            network,
            last_fee_rate: parking_lot::Mutex::new(REGTEST_FEE_RATE_SAT_VB),
        })
    }

    /// This federator's own derived keypair for the multisig, along the same
    /// path used to derive the address (§4.2).
    fn own_keypair(&self) -> Result<(bitcoin::secp256k1::SecretKey, PublicKey)> {
        let secp = Secp256k1::new();
        let children: Vec<ChildNumber> = self.derivation_path.as_ref().to_vec();
        let derived = self
            .xpriv
            .derive_priv(&secp, &children)
            .map_err(|e| Error::Crypto(format!("bitcoin key derivation failed: {e}")))?;
        let secret_key = derived.private_key;
        let public_key = PublicKey::new(secret_key.public_key(&secp));
        Ok((secret_key, public_key))
    }

    /// `estimaterawfee(1)`, falling back to the 2-block horizon on failure;
    /// never returns below the last successfully cached rate (§4.2.3).
    async fn current_fee_rate(&self) -> u64 {
        let resolved = match Self::parse_fee_rate(&self.rpc.estimate_raw_fee(1).await) {
            Some(rate) => Some(rate),
            None => Self::parse_fee_rate(&self.rpc.estimate_raw_fee(2).await),
        };

        let mut floor = self.last_fee_rate.lock();
        if let Some(rate) = resolved {
            let rate = rate.max(*floor);
            *floor = rate;
            rate
        } else {
            *floor
        }
    }

    fn parse_fee_rate(result: &Result<Value>) -> Option<u64> {
        let value = result.as_ref().ok()?;
        let btc_per_kvb = value.get("short")?.get("feerate")?.as_f64()?;
        Some(apply_safety_margin((btc_per_kvb * 100_000.0).round() as u64))
    }

    async fn fetch_utxos(&self) -> Result<Vec<Utxo>> {
        let address = self.multisig.address.to_string();
        let raw = self.rpc.list_unspent(0, &address).await?;
        raw.iter()
            .map(|entry| {
                let txid_str = entry
                    .get("txid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Bitcoin("listunspent entry missing txid".into()))?;
                let vout = entry
                    .get("vout")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Bitcoin("listunspent entry missing vout".into()))?;
                let amount_btc = entry
                    .get("amount")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| Error::Bitcoin("listunspent entry missing amount".into()))?;
                let confirmations = entry
                    .get("confirmations")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let txid = Txid::from_str(txid_str)
                    .map_err(|e| Error::Bitcoin(format!("invalid txid {txid_str}: {e}")))?;
                Ok(Utxo {
                    outpoint: bitcoin::OutPoint { txid, vout: vout as u32 },
                    amount: Amount::from_sat((amount_btc * 100_000_000.0).round() as u64),
                    confirmations,
                    script_pubkey: self.multisig.address.script_pubkey(),
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl BitcoinAdapter for RpcBitcoinAdapter {
    async fn create_partial_tx(
        &self,
        transfers: &[Transfer],
        sign_self: bool,
        no_change: bool,
        max_inputs: Option<usize>,
    ) -> Result<Psbt> {
        let utxos = self.fetch_utxos().await?;
        let fee_rate = self.current_fee_rate().await;
        let psbt = build_unsigned_psbt(BuildPsbtParams {
            utxos: &utxos,
            transfers,
            multisig: &self.multisig,
            fee_sat_per_vbyte: fee_rate,
            no_change,
            max_inputs,
        })?;
        if sign_self {
            self.sign(&psbt).await
        } else {
            Ok(psbt)
        }
    }

    async fn sign(&self, psbt: &Psbt) -> Result<Psbt> {
        let mut psbt = psbt.clone();
        let (secret_key, public_key) = self.own_keypair()?;
        let secp = Secp256k1::new();
        let unsigned_tx = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&unsigned_tx);

        for i in 0..psbt.inputs.len() {
            let input = &psbt.inputs[i];
            let witness_script = input
                .witness_script
                .clone()
                .ok_or_else(|| Error::Bitcoin(format!("input {i} missing witness_script")))?;
            let witness_utxo = input
                .witness_utxo
                .clone()
                .ok_or_else(|| Error::Bitcoin(format!("input {i} missing witness_utxo")))?;
            let sighash = cache
                .p2wsh_signature_hash(
                    i,
                    &witness_script,
                    witness_utxo.value,
                    EcdsaSighashType::All,
                )
                .map_err(|e| Error::Bitcoin(format!("sighash computation failed for input {i}: {e}")))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_ecdsa(&message, &secret_key);
            let ecdsa_sig = EcdsaSignature {
                signature,
                sighash_type: EcdsaSighashType::All,
            };
            psbt.inputs[i].partial_sigs.insert(public_key, ecdsa_sig);
        }
        Ok(psbt)
    }

    fn combine(&self, psbts: &[Psbt]) -> Result<Psbt> {
        let mut iter = psbts.iter();
        let mut merged = iter
            .next()
            .ok_or_else(|| Error::validation("cannot combine zero psbts"))?
            .clone();
        for other in iter {
            merged
                .combine(other.clone())
                .map_err(|e| Error::Bitcoin(format!("psbt combine failed: {e}")))?;
        }
        Ok(merged)
    }

    async fn submit(&self, psbt: &Psbt) -> Result<Txid> {
        let required = self.multisig.required_signers;
        for (i, input) in psbt.inputs.iter().enumerate() {
            if input.partial_sigs.len() < required {
                return Err(Error::validation(format!(
                    "input {i} has {} of {required} required signatures",
                    input.partial_sigs.len()
                )));
            }
        }

        let mut finalized = psbt.clone();
        for input in finalized.inputs.iter_mut() {
            let witness_script = input
                .witness_script
                .clone()
                .ok_or_else(|| Error::Bitcoin("missing witness_script during finalization".into()))?;
            // OP_CHECKMULTISIG's dummy-element off-by-one bug requires a
            // leading empty witness item, then `required` signatures in the
            // order their keys appear in the witness script.
            let mut stack: Vec<Vec<u8>> = vec![Vec::new()];
            let ordered_pubkeys = extract_pubkeys(&witness_script)?;
            for pk in &ordered_pubkeys {
                if let Some(sig) = input.partial_sigs.get(pk) {
                    stack.push(sig.to_vec());
                    if stack.len() - 1 >= required {
                        break;
                    }
                }
            }
            stack.push(witness_script.to_bytes());
            input.final_script_witness = Some(Witness::from_slice(&stack));
            input.partial_sigs.clear();
            input.witness_script = None;
        }

        let tx = finalized
            .extract_tx()
            .map_err(|e| Error::Bitcoin(format!("tx extraction failed: {e}")))?;
        let hex_tx = bitcoin::consensus::encode::serialize_hex(&tx);
        let txid_str = self.rpc.send_raw_transaction(&hex_tx).await?;
        Txid::from_str(&txid_str).map_err(|e| Error::Bitcoin(format!("invalid txid returned by node: {e}")))
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Option<u32>> {
        match self.rpc.get_transaction(&txid.to_string()).await? {
            Some(value) => Ok(value.get("confirmations").and_then(Value::as_u64).map(|c| c as u32)),
            None => Ok(None),
        }
    }

    fn get_transfers_from(&self, psbt: &Psbt) -> Result<Vec<(BtcAddress, u8, Amount)>> {
        let nonces = read_op_return_nonces(psbt)?;
        let mut out = Vec::with_capacity(nonces.len());
        for (i, nonce) in nonces.iter().enumerate() {
            let output = psbt
                .unsigned_tx
                .output
                .get(i + 1)
                .ok_or_else(|| Error::validation(format!("psbt missing payment output for nonce index {i}")))?;
            let address = BtcAddress::from_script(&output.script_pubkey, self.network)
                .map_err(|e| Error::validation(format!("unrecognized payment script at output {}: {e}", i + 1)))?;
            out.push((address, *nonce, output.value));
        }
        Ok(out)
    }

    async fn multisig_balance(&self, change_only: bool) -> Result<Amount> {
        let utxos = self.fetch_utxos().await?;
        let min_conf = if change_only { 0 } else { 1 };
        Ok(Amount::from_sat(
            utxos
                .iter()
                .filter(|u| u.confirmations >= min_conf)
                .map(|u| u.amount.to_sat())
                .sum(),
        ))
    }

    fn validate_address(&self, addr: &str) -> bool {
        addr.parse::<BtcAddress<bitcoin::address::NetworkUnchecked>>()
            .ok()
            .and_then(|a| a.require_network(self.network).ok())
            .is_some()
    }

    fn early_tx_hash(&self, psbt: &Psbt) -> Result<H256> {
        let txid = psbt.unsigned_tx.compute_txid();
        Ok(H256::from_slice(txid.to_byte_array().as_slice()))
    }

    fn canonical_address(&self) -> &MultisigAddress {
        &self.multisig
    }
}

/// Recover the ordered public keys pushed into a bare multisig witness
/// script, in the order `OP_M <pk1> <pk2> ... <pkN> OP_N OP_CHECKMULTISIG`.
pub(crate) fn extract_pubkeys(witness_script: &bitcoin::ScriptBuf) -> Result<Vec<PublicKey>> {
    let mut pubkeys = Vec::new();
    for instruction in witness_script.instructions() {
        if let Ok(bitcoin::script::Instruction::PushBytes(bytes)) = instruction {
            if let Ok(pk) = PublicKey::from_slice(bytes.as_bytes()) {
                pubkeys.push(pk);
            }
        }
    }
    if pubkeys.is_empty() {
        return Err(Error::Bitcoin("witness script carries no public keys".into()));
    }
    Ok(pubkeys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_pubkeys_reads_script_in_order() {
        let multisig = crate::bitcoin::fixtures::sample_multisig();
        let pubkeys = extract_pubkeys(&multisig.witness_script).unwrap();
        assert_eq!(pubkeys.len(), multisig.total_signers);
    }
}
