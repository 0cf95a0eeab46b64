//! End-to-end batch lifecycle with a 2-of-3 federation: batch formation,
//! sending-signature gathering (including the local node's own-sign
//! threshold), Bitcoin co-signing, broadcast, and the mined update.
//!
//! Each node computes its own in-memory [`TransferBatch`] copy; the explicit
//! `sync_from` calls below stand in for what the p2p layer (§4.6) otherwise
//! carries between federators — the gathered signature/PSBT state.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Network;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::H256;

use fastbtc_federator::batch_service::BatchService;
use fastbtc_federator::bitcoin::address::MultisigAddress;
use fastbtc_federator::bitcoin::BitcoinAdapter;
use fastbtc_federator::chain::ChainAdapter;
use fastbtc_federator::config::{BatchConfig, BitcoinConfig, ChainConfig};
use fastbtc_federator::domain::batch::TransferBatch;
use fastbtc_federator::domain::transfer::{Transfer, TransferStatus};
use fastbtc_federator::store::BatchStore;

use common::{deterministic_xprivs, xpub_strings, FakeBitcoinNetwork, FakeChain, FakeChainAdapter};

const DEST_ADDRESS: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

struct Federator {
    service: BatchService,
    chain: Arc<FakeChainAdapter>,
}

/// Copies the gathered signatures/PSBT from `source` onto `target`, mimicking
/// the batch artefact a node receives from its peers over p2p.
fn sync_from(target: &mut TransferBatch, source: &TransferBatch) {
    target.sending_signers = source.sending_signers.clone();
    target.sending_signatures = source.sending_signatures.clone();
    target.mined_signers = source.mined_signers.clone();
    target.mined_signatures = source.mined_signatures.clone();
    target.signed_psbt = source.signed_psbt.clone();
}

async fn build_federation() -> (Vec<Federator>, FakeChain, FakeBitcoinNetwork) {
    let xprivs = deterministic_xprivs(3);
    let xpubs = xpub_strings(&xprivs);
    let multisig = MultisigAddress::derive(&xpubs, "m/0", 2, Network::Regtest).unwrap();
    let btc_network = FakeBitcoinNetwork::new(multisig, Network::Regtest, 50_000_000);

    let wallets: Vec<LocalWallet> = (0..3).map(|_| LocalWallet::new(&mut rand::thread_rng())).collect();
    let federator_set: HashSet<_> = wallets.iter().map(|w| w.address()).collect();
    let chain = FakeChain::new();
    chain.seed_transfer(DEST_ADDRESS, 0, 1_000_000);
    let transfer = Transfer::new(DEST_ADDRESS.to_string(), 0, 1_000_000, "0xdeadbeef".into(), H256::zero(), 0, 1).unwrap();

    let batch_config = BatchConfig { max_transfers_in_batch: 10, max_passed_blocks_in_batch: 100, ..BatchConfig::default() };
    let chain_config = ChainConfig { required_confirmations: 2, ..ChainConfig::default() };
    let bitcoin_config = BitcoinConfig { num_required_signers: 2, ..BitcoinConfig::default() };

    let mut federators = Vec::new();
    for (i, wallet) in wallets.into_iter().enumerate() {
        let chain_adapter = Arc::new(chain.adapter(wallet, federator_set.clone()));
        let bitcoin_adapter: Arc<dyn BitcoinAdapter> = Arc::new(btc_network.adapter(xprivs[i]));
        let store = Arc::new(BatchStore::open(std::path::Path::new(":memory:")).await.unwrap());
        store.insert_new_transfers(vec![transfer.clone()]).await.unwrap();
        let service = BatchService::new(
            store,
            chain_adapter.clone() as Arc<dyn ChainAdapter>,
            bitcoin_adapter,
            batch_config.clone(),
            chain_config.clone(),
            bitcoin_config.clone(),
        );
        federators.push(Federator { service, chain: chain_adapter });
    }
    (federators, chain, btc_network)
}

#[tokio::test]
async fn batch_progresses_new_to_sending_to_mined() {
    let (federators, chain, btc_network) = build_federation().await;

    // Every node derives the identical in-memory batch from the same seeded
    // transfer and the same shared UTXO set (§4.5 determinism).
    let mut batch_a = federators[0].service.get_current_batch().await.unwrap().unwrap();
    let mut batch_b = federators[1].service.get_current_batch().await.unwrap().unwrap();
    let mut batch_c = federators[2].service.get_current_batch().await.unwrap().unwrap();
    assert_eq!(batch_a.bitcoin_tx_hash, batch_b.bitcoin_tx_hash);
    assert_eq!(batch_a.bitcoin_tx_hash, batch_c.bitcoin_tx_hash);

    // Node C signs the sending update; node A gathers the one contribution
    // and, since that reaches M-1, co-signs itself to complete the M-of-N set.
    let sig_c = federators[2].service.sign_sending_update(&batch_c).await.unwrap();
    let changed = federators[0]
        .service
        .add_sending_signatures(&mut batch_a, vec![sig_c])
        .await
        .unwrap();
    assert!(changed);
    assert!(batch_a.has_enough_sending_signatures(2));
    assert!(batch_a.sending_signers.contains(&federators[0].chain.own_address()));

    federators[0].service.mark_as_sending_in_chain(&mut batch_a).await.unwrap();
    assert_eq!(chain.status_of(DEST_ADDRESS, 0), Some(TransferStatus::Sending));
    assert_eq!(federators[0].chain.sending_calls(), 1);

    // Calling it again is a no-op (§5 idempotence): the chain call count does not change.
    federators[0].service.mark_as_sending_in_chain(&mut batch_a).await.unwrap();
    assert_eq!(federators[0].chain.sending_calls(), 1);

    sync_from(&mut batch_b, &batch_a);
    sync_from(&mut batch_c, &batch_a);

    // Every node's own contribution comes from signing its own copy of the
    // batch; node A then folds B's and C's signed PSBTs into its own.
    federators[1].service.add_bitcoin_signatures(&mut batch_b, vec![]).await.unwrap();
    federators[2].service.add_bitcoin_signatures(&mut batch_c, vec![]).await.unwrap();

    let changed = federators[0]
        .service
        .add_bitcoin_signatures(&mut batch_a, vec![batch_b.signed_psbt.clone().unwrap(), batch_c.signed_psbt.clone().unwrap()])
        .await
        .unwrap();
    assert!(changed);
    assert!(batch_a.has_enough_bitcoin_signatures(2));

    federators[0].service.send_to_bitcoin(&batch_a).await.unwrap();
    let txid = batch_a.signed_psbt.as_ref().unwrap().unsigned_tx.compute_txid();
    btc_network.confirm(&txid, 1);

    sync_from(&mut batch_b, &batch_a);
    sync_from(&mut batch_c, &batch_a);

    let sig_b = federators[1].service.sign_mined_update(&batch_b).await.unwrap();
    let sig_c = federators[2].service.sign_mined_update(&batch_c).await.unwrap();
    federators[0]
        .service
        .add_mined_signatures(&mut batch_a, vec![sig_b, sig_c])
        .await
        .unwrap();
    assert!(batch_a.has_enough_mined_signatures(2));

    federators[0].service.mark_as_mined_in_chain(&mut batch_a).await.unwrap();
    assert_eq!(chain.status_of(DEST_ADDRESS, 0), Some(TransferStatus::Mined));
    assert_eq!(federators[0].chain.mined_calls(), 1);
}

#[tokio::test]
async fn no_new_transfers_yields_no_batch() {
    let xprivs = deterministic_xprivs(1);
    let xpubs = xpub_strings(&xprivs);
    let multisig = MultisigAddress::derive(&xpubs, "m/0", 1, Network::Regtest).unwrap();
    let btc_network = FakeBitcoinNetwork::new(multisig, Network::Regtest, 50_000_000);
    let wallet = LocalWallet::new(&mut rand::thread_rng());
    let mut federator_set = HashSet::new();
    federator_set.insert(wallet.address());
    let chain = FakeChain::new();

    let chain_adapter: Arc<dyn ChainAdapter> = Arc::new(chain.adapter(wallet, federator_set));
    let bitcoin_adapter: Arc<dyn BitcoinAdapter> = Arc::new(btc_network.adapter(xprivs[0]));
    let store = Arc::new(BatchStore::open(std::path::Path::new(":memory:")).await.unwrap());
    let service = BatchService::new(
        store,
        chain_adapter,
        bitcoin_adapter,
        BatchConfig::default(),
        ChainConfig::default(),
        BitcoinConfig { num_required_signers: 1, ..BitcoinConfig::default() },
    );
    assert!(service.get_current_batch().await.unwrap().is_none());
}
