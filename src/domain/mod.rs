//! The data model (§3): `Transfer`, `TransferBatch`, and their DTOs.

pub mod batch;
pub mod transfer;

pub use batch::{TransferBatch, TransferBatchDto};
pub use transfer::{Transfer, TransferId, TransferStatus};
