//! Shared in-memory doubles for C1 (chain) and C2 (bitcoin) used across the
//! integration tests. Both reuse the crate's real pure logic (PSBT
//! construction, EIP-191 signing/recovery) so a test exercises the actual
//! code paths a federator runs; only the RPC/network edges are faked.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Address as BtcAddress, Amount, Network, OutPoint, PublicKey, Txid};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256};
use parking_lot::Mutex;
use std::str::FromStr;

use fastbtc_federator::bitcoin::address::MultisigAddress;
use fastbtc_federator::bitcoin::psbt::{build_unsigned_psbt, read_op_return_nonces, BuildPsbtParams, Utxo};
use fastbtc_federator::bitcoin::BitcoinAdapter;
use fastbtc_federator::chain::{ChainAdapter, ChainEvent, TransferView};
use fastbtc_federator::domain::transfer::{Transfer, TransferId, TransferStatus};
use fastbtc_federator::error::{Error, Result};

/// Deterministically derives `count` BIP32 master keys from a fixed set of
/// seeds so the same multisig can be reconstructed call after call within one
/// test, without depending on the disallowed `rand`/real-entropy sources.
pub fn deterministic_xprivs(count: usize) -> Vec<Xpriv> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = b'f';
            seed[1] = i as u8;
            Xpriv::new_master(Network::Regtest, &seed).expect("master key derivation")
        })
        .collect()
}

pub fn xpub_strings(xprivs: &[Xpriv]) -> Vec<String> {
    let secp = Secp256k1::new();
    xprivs.iter().map(|x| Xpub::from_priv(&secp, x).to_string()).collect()
}

/// The ledger every federator's [`FakeBitcoinAdapter`] shares: the multisig's
/// UTXO set and the submitted-transaction confirmation map.
#[derive(Default)]
struct SharedUtxoSet {
    utxos: Vec<Utxo>,
    submitted: HashMap<Txid, u32>,
}

pub struct FakeBitcoinNetwork {
    multisig: MultisigAddress,
    network: Network,
    state: Arc<Mutex<SharedUtxoSet>>,
}

impl FakeBitcoinNetwork {
    pub fn new(multisig: MultisigAddress, network: Network, funding_sat: u64) -> Self {
        let utxo = Utxo {
            outpoint: OutPoint { txid: Txid::from_byte_array([9u8; 32]), vout: 0 },
            amount: Amount::from_sat(funding_sat),
            confirmations: 6,
            script_pubkey: multisig.address.script_pubkey(),
        };
        Self {
            multisig,
            network,
            state: Arc::new(Mutex::new(SharedUtxoSet { utxos: vec![utxo], submitted: HashMap::new() })),
        }
    }

    pub fn adapter(&self, xpriv: Xpriv) -> FakeBitcoinAdapter {
        FakeBitcoinAdapter {
            xpriv,
            derivation_path: DerivationPath::from_str("m/0").unwrap(),
            multisig: self.multisig.clone(),
            network: self.network,
            state: self.state.clone(),
        }
    }

    pub fn confirm(&self, txid: &Txid, confirmations: u32) {
        self.state.lock().submitted.insert(*txid, confirmations);
    }

    pub fn submitted_txids(&self) -> Vec<Txid> {
        self.state.lock().submitted.keys().copied().collect()
    }
}

/// A federator's view of the shared payout multisig, backed by in-memory
/// UTXOs and a submitted-transaction ledger instead of a real Bitcoin node.
pub struct FakeBitcoinAdapter {
    xpriv: Xpriv,
    derivation_path: DerivationPath,
    multisig: MultisigAddress,
    network: Network,
    state: Arc<Mutex<SharedUtxoSet>>,
}

impl FakeBitcoinAdapter {
    fn own_keypair(&self) -> Result<(bitcoin::secp256k1::SecretKey, PublicKey)> {
        let secp = Secp256k1::new();
        let children: Vec<ChildNumber> = self.derivation_path.as_ref().to_vec();
        let derived = self
            .xpriv
            .derive_priv(&secp, &children)
            .map_err(|e| Error::Crypto(format!("derivation failed: {e}")))?;
        let secret_key = derived.private_key;
        Ok((secret_key, PublicKey::new(secret_key.public_key(&secp))))
    }
}

#[async_trait::async_trait]
impl BitcoinAdapter for FakeBitcoinAdapter {
    async fn create_partial_tx(
        &self,
        transfers: &[Transfer],
        sign_self: bool,
        no_change: bool,
        max_inputs: Option<usize>,
    ) -> Result<Psbt> {
        let utxos = self.state.lock().utxos.clone();
        let psbt = build_unsigned_psbt(BuildPsbtParams {
            utxos: &utxos,
            transfers,
            multisig: &self.multisig,
            fee_sat_per_vbyte: 10,
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
            let witness_script = input.witness_script.clone().ok_or_else(|| Error::Bitcoin("missing witness script".into()))?;
            let witness_utxo = input.witness_utxo.clone().ok_or_else(|| Error::Bitcoin("missing witness utxo".into()))?;
            let sighash = cache
                .p2wsh_signature_hash(i, &witness_script, witness_utxo.value, EcdsaSighashType::All)
                .map_err(|e| Error::Bitcoin(format!("sighash failed: {e}")))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_ecdsa(&message, &secret_key);
            psbt.inputs[i].partial_sigs.insert(
                public_key,
                EcdsaSignature { signature, sighash_type: EcdsaSighashType::All },
            );
        }
        Ok(psbt)
    }

    fn combine(&self, psbts: &[Psbt]) -> Result<Psbt> {
        let mut iter = psbts.iter();
        let mut merged = iter.next().ok_or_else(|| Error::validation("cannot combine zero psbts"))?.clone();
        for other in iter {
            merged.combine(other.clone()).map_err(|e| Error::Bitcoin(format!("combine failed: {e}")))?;
        }
        Ok(merged)
    }

    async fn submit(&self, psbt: &Psbt) -> Result<Txid> {
        let required = self.multisig.required_signers;
        for input in &psbt.inputs {
            if input.partial_sigs.len() < required {
                return Err(Error::validation("insufficient signatures to submit"));
            }
        }
        let txid = psbt.unsigned_tx.compute_txid();
        self.state.lock().submitted.entry(txid).or_insert(0);
        Ok(txid)
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Option<u32>> {
        Ok(self.state.lock().submitted.get(txid).copied())
    }

    fn get_transfers_from(&self, psbt: &Psbt) -> Result<Vec<(BtcAddress, u8, Amount)>> {
        let nonces = read_op_return_nonces(psbt)?;
        let mut out = Vec::with_capacity(nonces.len());
        for (i, nonce) in nonces.iter().enumerate() {
            let output = psbt.unsigned_tx.output.get(i + 1).ok_or_else(|| Error::validation("missing payment output"))?;
            let address = BtcAddress::from_script(&output.script_pubkey, self.network)
                .map_err(|e| Error::validation(format!("unrecognized script: {e}")))?;
            out.push((address, *nonce, output.value));
        }
        Ok(out)
    }

    async fn multisig_balance(&self, _change_only: bool) -> Result<Amount> {
        Ok(Amount::from_sat(self.state.lock().utxos.iter().map(|u| u.amount.to_sat()).sum()))
    }

    fn validate_address(&self, addr: &str) -> bool {
        addr.parse::<BtcAddress<bitcoin::address::NetworkUnchecked>>()
            .ok()
            .and_then(|a| a.require_network(self.network).ok())
            .is_some()
    }

    fn early_tx_hash(&self, psbt: &Psbt) -> Result<H256> {
        Ok(H256::from_slice(psbt.unsigned_tx.compute_txid().to_byte_array().as_slice()))
    }

    fn canonical_address(&self) -> &MultisigAddress {
        &self.multisig
    }
}

/// One shared sidechain ledger several [`FakeChainAdapter`] handles point
/// into, so every federator in a test observes the same transfer statuses.
#[derive(Default)]
struct SharedChain {
    transfers: HashMap<(String, u8), TransferView>,
    block: AtomicU64,
}

pub struct FakeChainAdapter {
    wallet: LocalWallet,
    federators: HashSet<Address>,
    shared: Arc<Mutex<SharedChain>>,
    sending_counter: AtomicU32,
    mined_counter: AtomicU32,
}

pub struct FakeChain {
    shared: Arc<Mutex<SharedChain>>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self { shared: Arc::new(Mutex::new(SharedChain::default())) }
    }

    pub fn adapter(&self, wallet: LocalWallet, federators: HashSet<Address>) -> FakeChainAdapter {
        FakeChainAdapter {
            wallet,
            federators,
            shared: self.shared.clone(),
            sending_counter: AtomicU32::new(0),
            mined_counter: AtomicU32::new(0),
        }
    }

    pub fn seed_transfer(&self, btc_address: &str, nonce: u8, amount_sat: u64) {
        self.shared.lock().transfers.insert(
            (btc_address.to_lowercase(), nonce),
            TransferView { status: TransferStatus::New, total_amount_sat: amount_sat },
        );
    }

    pub fn status_of(&self, btc_address: &str, nonce: u8) -> Option<TransferStatus> {
        self.shared.lock().transfers.get(&(btc_address.to_lowercase(), nonce)).map(|v| v.status)
    }

    pub fn set_block(&self, block: u64) {
        self.shared.lock().block.store(block, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl ChainAdapter for FakeChainAdapter {
    async fn current_block(&self) -> Result<u64> {
        Ok(self.shared.lock().block.load(Ordering::Relaxed))
    }

    async fn get_transfer(&self, btc_address: &str, nonce: u8, _at_block: Option<u64>) -> Result<TransferView> {
        self.shared
            .lock()
            .transfers
            .get(&(btc_address.to_lowercase(), nonce))
            .copied()
            .ok_or_else(|| Error::NotFound(format!("transfer {btc_address}/{nonce}")))
    }

    async fn get_update_hash_for_sending(&self, bitcoin_tx_hash: H256, transfer_ids: &[TransferId]) -> Result<H256> {
        use sha3::{Digest, Keccak256};
        let mut hasher = Keccak256::new();
        hasher.update(bitcoin_tx_hash.as_bytes());
        for id in transfer_ids {
            hasher.update(id.0);
        }
        hasher.update(b"sending");
        Ok(H256::from_slice(&hasher.finalize()))
    }

    async fn get_update_hash_for_mined(&self, transfer_ids: &[TransferId]) -> Result<H256> {
        use sha3::{Digest, Keccak256};
        let mut hasher = Keccak256::new();
        for id in transfer_ids {
            hasher.update(id.0);
        }
        hasher.update(b"mined");
        Ok(H256::from_slice(&hasher.finalize()))
    }

    async fn federators(&self) -> Result<HashSet<Address>> {
        Ok(self.federators.clone())
    }

    async fn mark_as_sending(&self, _bitcoin_tx_hash: H256, transfer_ids: &[TransferId], _signatures: &[(Address, Signature)]) -> Result<()> {
        self.sending_counter.fetch_add(1, Ordering::Relaxed);
        self.advance_status(transfer_ids, TransferStatus::Sending)
    }

    async fn mark_as_mined(&self, transfer_ids: &[TransferId], _signatures: &[(Address, Signature)]) -> Result<()> {
        self.mined_counter.fetch_add(1, Ordering::Relaxed);
        self.advance_status(transfer_ids, TransferStatus::Mined)
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        fastbtc_federator::crypto::eip191::sign_message(&self.wallet, message).await
    }

    fn recover(&self, message: &[u8], signature: &Signature) -> Result<Address> {
        fastbtc_federator::crypto::eip191::recover_address(message, signature)
    }

    fn own_address(&self) -> Address {
        self.wallet.address()
    }

    async fn scan_events(&self, _from_block: u64, _to_block: u64) -> Result<Vec<ChainEvent>> {
        Ok(Vec::new())
    }
}

impl FakeChainAdapter {
    pub fn sending_calls(&self) -> u32 {
        self.sending_counter.load(Ordering::Relaxed)
    }

    pub fn mined_calls(&self) -> u32 {
        self.mined_counter.load(Ordering::Relaxed)
    }

    fn advance_status(&self, transfer_ids: &[TransferId], status: TransferStatus) -> Result<()> {
        let mut shared = self.shared.lock();
        // Transfers are keyed by (address, nonce) in `SharedChain`; recompute
        // each key's id to find the match, since callers only carry ids here.
        let matches: Vec<(String, u8)> = shared
            .transfers
            .keys()
            .filter(|(addr, nonce)| transfer_ids.contains(&TransferId::derive(addr, *nonce)))
            .cloned()
            .collect();
        for key in matches {
            if let Some(view) = shared.transfers.get_mut(&key) {
                view.status = status;
            }
        }
        Ok(())
    }
}
