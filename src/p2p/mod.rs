//! The P2P group (C6, §4.6): single-threaded cooperative message dispatch
//! over authenticated TCP connections to the other federators.

pub mod messages;
pub mod pool;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::chain::ChainAdapter;
use crate::error::{Error, Result};
use crate::utils::task::{spawn_tracked, TaskTracker, TaskType};
use crate::utils::timeout::Timeouts;

pub use messages::{Envelope, Message};
pub use pool::{ConnectionPool, NodeEvent};

/// Drives the connection pool and the inbound listener; `node_loop` reads
/// from [`Self::inbound`] and calls [`Self::pool`] to reply/broadcast.
pub struct P2pGroup {
    pub pool: Arc<ConnectionPool>,
    pub inbound: mpsc::Receiver<(String, Envelope)>,
    pub events: mpsc::Receiver<NodeEvent>,
}

impl P2pGroup {
    pub fn start(
        listen_port: u16,
        peers: Vec<(String, String)>,
        security: Vec<u8>,
        outbound_queue_capacity: usize,
        chain: Arc<dyn ChainAdapter>,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let pool = Arc::new(ConnectionPool::new(
            event_tx,
            inbound_tx.clone(),
            outbound_queue_capacity,
            security.clone(),
            tracker.clone(),
        ));

        for (peer_id, addr) in peers {
            pool.connect(peer_id, addr, chain.clone());
        }

        spawn_tracked(TaskType::P2pHandler, tracker.clone(), {
            let chain = chain.clone();
            let security = security.clone();
            async move {
                if let Err(e) = run_listener(listen_port, chain, security, inbound_tx).await {
                    tracing::error!(error = %e, "p2p listener exited");
                }
            }
        });

        Self {
            pool,
            inbound: inbound_rx,
            events: event_rx,
        }
    }

    pub fn broadcast(&self, source_node_id: &str, message: Message) {
        self.pool.broadcast(Envelope::new(source_node_id, message));
    }

    pub fn send_to(&self, peer_id: &str, source_node_id: &str, message: Message) {
        self.pool.send_to(peer_id, Envelope::new(source_node_id, message));
    }
}

async fn run_listener(
    listen_port: u16,
    chain: Arc<dyn ChainAdapter>,
    security: Vec<u8>,
    inbound: mpsc::Sender<(String, Envelope)>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port))
        .await
        .map_err(|e| Error::P2p(format!("binding p2p listener on port {listen_port}: {e}")))?;
    let timeouts = Timeouts::default();

    loop {
        let (mut stream, peer_addr) = listener.accept().await.map_err(Error::Io)?;
        let chain = chain.clone();
        let security = security.clone();
        let inbound = inbound.clone();
        let timeouts = timeouts.clone();
        tokio::spawn(async move {
            match transport::server_handshake(&mut stream, chain.as_ref(), &security, &timeouts).await {
                Ok(federator_address) => {
                    let peer_id = format!("{federator_address:#x}");
                    tracing::info!(%peer_addr, %federator_address, "inbound p2p connection authenticated");
                    loop {
                        match transport::read_envelope(&mut stream).await {
                            Ok(envelope) => {
                                if inbound.send((peer_id.clone(), envelope)).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(%peer_addr, error = %e, "inbound p2p handshake failed");
                }
            }
        });
    }
}
