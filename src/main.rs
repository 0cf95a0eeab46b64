//! Binary entry point: wires the concrete adapters (C1/C2/C3), the pure
//! services (C4/C5/C7/C9), and the p2p transport (C6) into one [`node::NodeLoop`]
//! and runs it until cancellation or a fatal error (§5, §6 exit codes).

use std::path::PathBuf;
use std::sync::Arc;

use bitcoin::Network;
use tokio_util::sync::CancellationToken;

use fastbtc_federator::batch_service::BatchService;
use fastbtc_federator::bitcoin::address::MultisigAddress;
use fastbtc_federator::bitcoin::rpc::BitcoinRpcClient;
use fastbtc_federator::bitcoin::{assert_early_tx_hash_invariant, RpcBitcoinAdapter};
use fastbtc_federator::chain::EthChainAdapter;
use fastbtc_federator::config::{BitcoinNetwork, Config};
use fastbtc_federator::crypto::keystore::FederatorKeystore;
use fastbtc_federator::error::exit_code;
use fastbtc_federator::monitoring::Metrics;
use fastbtc_federator::node::NodeLoop;
use fastbtc_federator::p2p::P2pGroup;
use fastbtc_federator::replenisher::Replenisher;
use fastbtc_federator::store::BatchStore;
use fastbtc_federator::utils::task::TaskTracker;

/// Parses `--config <path>` off argv; environment variables still take
/// precedence over whatever the file sets (§2.1 layering).
fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

fn network_of(n: BitcoinNetwork) -> Network {
    match n {
        BitcoinNetwork::Mainnet => Network::Bitcoin,
        BitcoinNetwork::Testnet => Network::Testnet,
        BitcoinNetwork::Regtest => Network::Regtest,
    }
}

/// `peer_id@host:port` — the federator's sidechain address (lowercase hex)
/// paired with its p2p listen endpoint.
fn parse_peer(entry: &str) -> Option<(String, String)> {
    let (id, addr) = entry.split_once('@')?;
    Some((id.trim().to_lowercase(), addr.trim().to_string()))
}

#[tokio::main]
async fn main() {
    let config_path = config_path_from_args();
    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(exit_code::BITCOIN_HEALTH_CHECK_FAILED);
        }
    };

    fastbtc_federator::logging::init(&config.logging);

    let code = run(config).await;
    std::process::exit(code);
}

async fn run(config: Config) -> i32 {
    tracing::info!("starting fastbtc-federator");

    if let Err(e) = assert_early_tx_hash_invariant() {
        tracing::error!(error = %e, "early-tx-hash startup sanity check failed");
        return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
    }

    let network = network_of(config.bitcoin.network);
    let keystore = match FederatorKeystore::from_env(
        &config.keys.master_private_key_hex_env,
        &config.keys.bitcoin_xpriv_env,
        network,
    ) {
        Ok(k) => k,
        Err(e) => {
            tracing::error!(error = %e, "failed to load signing keys");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };

    let wallet = keystore.sidechain_wallet().clone();
    let chain = match EthChainAdapter::new(config.chain.clone(), wallet) {
        Ok(c) => Arc::new(c) as Arc<dyn fastbtc_federator::chain::ChainAdapter>,
        Err(e) => {
            tracing::error!(error = %e, "failed to construct chain adapter");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };

    let multisig = match MultisigAddress::derive(
        &config.bitcoin.federator_xpubs,
        &config.bitcoin.derivation_path,
        config.bitcoin.num_required_signers,
        network,
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "failed to derive payout multisig address");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };

    let rpc = BitcoinRpcClient::new(
        config.bitcoin.rpc_url.clone(),
        config.bitcoin.rpc_user.clone(),
        config.bitcoin.rpc_password.clone(),
    );
    let bitcoin_adapter = match RpcBitcoinAdapter::new(
        rpc,
        multisig,
        &config.bitcoin.derivation_path,
        &keystore,
        network,
    ) {
        Ok(b) => Arc::new(b) as Arc<dyn fastbtc_federator::bitcoin::BitcoinAdapter>,
        Err(e) => {
            tracing::error!(error = %e, "failed to construct bitcoin adapter");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };

    let replenisher_multisig = match MultisigAddress::derive(
        &config.replenisher.replenisher_xpubs,
        &config.bitcoin.derivation_path,
        config.bitcoin.num_required_signers,
        network,
    ) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "failed to derive replenisher multisig address");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };
    let replenisher_rpc = BitcoinRpcClient::new(
        config.bitcoin.rpc_url.clone(),
        config.bitcoin.rpc_user.clone(),
        config.bitcoin.rpc_password.clone(),
    );
    let replenisher_adapter = match RpcBitcoinAdapter::new(
        replenisher_rpc,
        replenisher_multisig,
        &config.bitcoin.derivation_path,
        &keystore,
        network,
    ) {
        Ok(b) => Arc::new(b) as Arc<dyn fastbtc_federator::bitcoin::BitcoinAdapter>,
        Err(e) => {
            tracing::error!(error = %e, "failed to construct replenisher bitcoin adapter");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };

    let store = match BatchStore::open(&config.database.path).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "failed to open batch store");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };

    let metrics = Arc::new(Metrics::new());

    let batch_service = Arc::new(BatchService::new(
        store.clone(),
        chain.clone(),
        bitcoin_adapter.clone(),
        config.batch.clone(),
        config.chain.clone(),
        config.bitcoin.clone(),
    ));

    let replenisher = Replenisher::new(
        bitcoin_adapter.clone(),
        replenisher_adapter,
        config.replenisher.clone(),
        metrics.clone(),
    );

    let federators = match chain.federators().await {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(error = %e, "failed to read federator set at startup");
            return exit_code::BITCOIN_HEALTH_CHECK_FAILED;
        }
    };
    if !federators.contains(&chain.own_address()) {
        tracing::error!("this node's sidechain address is not in the current federator set");
        return exit_code::NEVER_BECAME_FEDERATOR;
    }

    let peers: Vec<(String, String)> = config.p2p.peers.iter().filter_map(|s| parse_peer(s)).collect();
    let security = std::env::var("P2P_SECURITY").unwrap_or_default().into_bytes();
    let tracker = TaskTracker::new();
    let p2p = P2pGroup::start(
        config.p2p.listen_port,
        peers,
        security,
        config.p2p.outbound_queue_capacity,
        chain.clone(),
        tracker.clone(),
    );

    let cancellation = CancellationToken::new();
    let shutdown_token = cancellation.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_token.cancel();
    });

    let mut node_loop = NodeLoop::new(
        chain,
        bitcoin_adapter,
        store,
        batch_service,
        p2p,
        replenisher,
        metrics,
        config.batch,
        config.bitcoin,
        config.chain.start_block,
        cancellation,
    );

    let result = node_loop.run().await;
    let code = fastbtc_federator::node::exit_code_for(&result);
    match &result {
        Ok(()) => tracing::info!("shut down cleanly"),
        Err(e) => tracing::error!(error = %e, exit_code = code, "node loop exited"),
    }
    code
}
