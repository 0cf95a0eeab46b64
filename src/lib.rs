//! fastbtc-federator: the coordinator daemon of a federated sidechain-to-Bitcoin
//! bridge (§1). Across all federator nodes this crate drives one transfer batch
//! from creation through Bitcoin broadcast and back to on-chain acknowledgment.
//!
//! Module map mirrors the component table in §2:
//! - [`chain`] — C1, the sidechain adapter
//! - [`bitcoin`] — C2, the Bitcoin adapter
//! - [`store`] — C3, the batch store
//! - [`validator`] — C4, the pure batch validator
//! - [`batch_service`] — C5, the transfer-batch service
//! - [`p2p`] — C6, the authenticated peer group
//! - [`initiator`] — C7, initiator voting
//! - [`node`] — C8, the main node loop
//! - [`replenisher`] — C9, the replenishment sub-flow

pub mod batch_service;
pub mod bitcoin;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod initiator;
pub mod logging;
pub mod monitoring;
pub mod node;
pub mod p2p;
pub mod replenisher;
pub mod store;
pub mod utils;
pub mod validator;

pub use error::{Error, Result};
