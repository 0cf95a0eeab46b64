//! Adversarial and idempotence scenarios: a non-federator's signature is
//! rejected rather than crashing the node (§4.4), a batch cannot be
//! re-persisted once a non-terminal one already exists (§4.3, §9), and the
//! store survives a close/reopen against a real file (crash recovery, §5).

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
use fastbtc_federator::domain::transfer::Transfer;
use fastbtc_federator::error::Error;
use fastbtc_federator::store::BatchStore;

use common::{deterministic_xprivs, xpub_strings, FakeBitcoinNetwork, FakeChain};

const DEST_ADDRESS: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

#[tokio::test]
async fn outsider_signature_is_rejected_not_counted() {
    let xprivs = deterministic_xprivs(3);
    let xpubs = xpub_strings(&xprivs);
    let multisig = MultisigAddress::derive(&xpubs, "m/0", 2, Network::Regtest).unwrap();
    let btc_network = FakeBitcoinNetwork::new(multisig, Network::Regtest, 50_000_000);

    let wallets: Vec<LocalWallet> = (0..3).map(|_| LocalWallet::new(&mut rand::thread_rng())).collect();
    let federator_set: HashSet<_> = wallets.iter().map(|w| w.address()).collect();
    let outsider = LocalWallet::new(&mut rand::thread_rng());
    assert!(!federator_set.contains(&outsider.address()));

    let chain = FakeChain::new();
    chain.seed_transfer(DEST_ADDRESS, 0, 1_000_000);
    let transfer = Transfer::new(DEST_ADDRESS.to_string(), 0, 1_000_000, "0xdeadbeef".into(), H256::zero(), 0, 1).unwrap();

    let chain_adapter: Arc<dyn ChainAdapter> = Arc::new(chain.adapter(wallets[0].clone(), federator_set));
    let bitcoin_adapter: Arc<dyn BitcoinAdapter> = Arc::new(btc_network.adapter(xprivs[0]));
    let store = Arc::new(BatchStore::open(std::path::Path::new(":memory:")).await.unwrap());
    store.insert_new_transfers(vec![transfer]).await.unwrap();
    let service = BatchService::new(
        store,
        chain_adapter,
        bitcoin_adapter,
        BatchConfig { max_transfers_in_batch: 10, ..BatchConfig::default() },
        ChainConfig { required_confirmations: 2, ..ChainConfig::default() },
        BitcoinConfig { num_required_signers: 2, ..BitcoinConfig::default() },
    );

    let mut batch = service.get_current_batch().await.unwrap().unwrap();
    let update_hash_message = b"whatever the outsider claims to have signed";
    let forged_sig = fastbtc_federator::crypto::eip191::sign_message(&outsider, update_hash_message)
        .await
        .unwrap();

    let changed = service
        .add_sending_signatures(&mut batch, vec![(outsider.address(), forged_sig)])
        .await
        .unwrap();
    assert!(!changed);
    assert!(batch.sending_signers.is_empty());
}

#[tokio::test]
async fn second_batch_cannot_be_persisted_while_one_is_pending() {
    let psbt = fastbtc_federator::bitcoin::fixtures::sample_unsigned_psbt();
    let t1 = Transfer::new(DEST_ADDRESS.to_string(), 0, 1_000, "0xa".into(), H256::zero(), 0, 1).unwrap();
    let t2 = Transfer::new(DEST_ADDRESS.to_string(), 1, 1_000, "0xa".into(), H256::zero(), 0, 2).unwrap();
    let batch_a = TransferBatch::new(vec![t1], H256::zero(), psbt.clone());
    let batch_b = TransferBatch::new(vec![t2], H256::zero(), psbt);

    let store = BatchStore::open(std::path::Path::new(":memory:")).await.unwrap();
    store.upsert(&batch_a, 10).await.unwrap();
    let result = store.upsert(&batch_b, 20).await;
    assert!(matches!(result, Err(Error::AlreadyApplied(_))));

    // Re-upserting the same batch (e.g. after a crash replays the same
    // iteration) is a no-op, not a second rejection (§5 idempotence).
    assert!(store.upsert(&batch_a, 10).await.is_ok());
}

#[tokio::test]
async fn store_survives_reopen_against_the_same_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("federator.sqlite3");

    let t = Transfer::new(DEST_ADDRESS.to_string(), 0, 1_000, "0xa".into(), H256::zero(), 0, 1).unwrap();
    let id = t.transfer_id;
    {
        let store = BatchStore::open(&path).await.unwrap();
        store.insert_new_transfers(vec![t]).await.unwrap();
    }

    // Simulate a crash/restart: reopen the same on-disk database.
    let store = BatchStore::open(&path).await.unwrap();
    let found = store.find_transfers(vec![id]).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].btc_address, DEST_ADDRESS);
}
