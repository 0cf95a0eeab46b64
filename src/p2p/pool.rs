//! Connection pool: one bounded outbound queue per peer, reconnect with
//! backoff, and availability events threaded to C7/C8 (§4.6.1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::chain::ChainAdapter;
use crate::p2p::messages::Envelope;
use crate::p2p::transport::{client_handshake, read_envelope, write_envelope};
use crate::utils::task::{spawn_tracked, TaskTracker, TaskType};
use crate::utils::timeout::Timeouts;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Fired when a peer's liveness changes, consumed by initiator voting (C7)
/// and the node loop (C8) to re-elect and clear scratch state promptly (§4.6.1).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Available(String),
    Unavailable(String),
}

struct PeerHandle {
    outbound: mpsc::Sender<Envelope>,
}

pub struct ConnectionPool {
    peers: Mutex<HashMap<String, PeerHandle>>,
    events: mpsc::Sender<NodeEvent>,
    inbound: mpsc::Sender<(String, Envelope)>,
    queue_capacity: usize,
    security: Vec<u8>,
    timeouts: Timeouts,
    tracker: Arc<TaskTracker>,
}

impl ConnectionPool {
    pub fn new(
        events: mpsc::Sender<NodeEvent>,
        inbound: mpsc::Sender<(String, Envelope)>,
        queue_capacity: usize,
        security: Vec<u8>,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            events,
            inbound,
            queue_capacity,
            security,
            timeouts: Timeouts::default(),
            tracker,
        }
    }

    /// Start (or restart) a managed, reconnecting connection to `addr`,
    /// identified externally by `peer_id`.
    pub fn connect(&self, peer_id: String, addr: String, chain: Arc<dyn ChainAdapter>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.peers.lock().insert(peer_id.clone(), PeerHandle { outbound: tx });

        let events = self.events.clone();
        let inbound = self.inbound.clone();
        let security = self.security.clone();
        let timeouts = self.timeouts.clone();
        spawn_tracked(TaskType::P2pHandler, self.tracker.clone(), async move {
            run_peer_connection(peer_id, addr, chain, rx, events, inbound, security, timeouts).await;
        });
    }

    /// Enqueue `envelope` for `peer_id`; a full queue drops the oldest send
    /// rather than blocking the caller, so one slow federator can't apply
    /// backpressure to broadcasts meant for the rest (§4.6.1).
    pub fn send_to(&self, peer_id: &str, envelope: Envelope) {
        let handle = self.peers.lock().get(peer_id).map(|h| h.outbound.clone());
        if let Some(tx) = handle {
            let _ = tx.try_send(envelope);
        }
    }

    pub fn broadcast(&self, envelope: Envelope) {
        let peer_ids: Vec<String> = self.peers.lock().keys().cloned().collect();
        for peer_id in peer_ids {
            self.send_to(&peer_id, envelope.clone());
        }
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_peer_connection(
    peer_id: String,
    addr: String,
    chain: Arc<dyn ChainAdapter>,
    mut rx: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<NodeEvent>,
    inbound: mpsc::Sender<(String, Envelope)>,
    security: Vec<u8>,
    timeouts: Timeouts,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(mut stream) => {
                match client_handshake(&mut stream, chain.as_ref(), &security, &timeouts).await {
                    Ok(peer_address) => {
                        tracing::info!(peer_id, %peer_address, "p2p connection established");
                        let _ = events.send(NodeEvent::Available(peer_id.clone())).await;
                        backoff = INITIAL_BACKOFF;

                        loop {
                            tokio::select! {
                                outgoing = rx.recv() => {
                                    match outgoing {
                                        Some(envelope) => {
                                            if write_envelope(&mut stream, &envelope).await.is_err() {
                                                break;
                                            }
                                        }
                                        None => return, // pool handle dropped; peer deregistered.
                                    }
                                }
                                incoming = read_envelope(&mut stream) => {
                                    match incoming {
                                        Ok(envelope) => {
                                            let _ = inbound.send((peer_id.clone(), envelope)).await;
                                        }
                                        Err(_) => break,
                                    }
                                }
                            }
                        }
                        let _ = events.send(NodeEvent::Unavailable(peer_id.clone())).await;
                    }
                    Err(e) => {
                        tracing::warn!(peer_id, error = %e, "p2p handshake failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer_id, error = %e, "p2p connect failed");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
