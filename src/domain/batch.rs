//! `TransferBatch`, the in-memory bundle in flight, and its DTO snapshot
//! (§3). The DTO is what gets persisted (§4.3) and exchanged over p2p (§4.6);
//! `TransferBatch` additionally carries the parsed PSBTs `bitcoin::psbt::Psbt`
//! that the DTO stores as base64.

use base64::Engine;
use bitcoin::psbt::Psbt;
use ethers::types::{Address, Signature, H256};
use serde::{Deserialize, Serialize};

use crate::domain::transfer::{Transfer, TransferId};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TransferBatch {
    pub transfers: Vec<Transfer>,
    pub sending_signatures: Vec<Signature>,
    pub sending_signers: Vec<Address>,
    pub mined_signatures: Vec<Signature>,
    pub mined_signers: Vec<Address>,
    pub bitcoin_tx_hash: H256,
    pub initial_psbt: Psbt,
    pub signed_psbt: Option<Psbt>,
}

impl TransferBatch {
    pub fn new(transfers: Vec<Transfer>, bitcoin_tx_hash: H256, initial_psbt: Psbt) -> Self {
        Self {
            transfers,
            sending_signatures: Vec::new(),
            sending_signers: Vec::new(),
            mined_signatures: Vec::new(),
            mined_signers: Vec::new(),
            bitcoin_tx_hash,
            initial_psbt,
            signed_psbt: None,
        }
    }

    pub fn transfer_ids(&self) -> Vec<TransferId> {
        self.transfers.iter().map(|t| t.transfer_id).collect()
    }

    /// Identity of a stored batch: the sorted set of its transfer ids (§4.3).
    pub fn identity(&self) -> Vec<TransferId> {
        let mut ids = self.transfer_ids();
        ids.sort();
        ids
    }

    pub fn has_enough_sending_signatures(&self, num_required: usize) -> bool {
        self.sending_signatures.len() >= num_required
    }

    pub fn has_enough_mined_signatures(&self, num_required: usize) -> bool {
        self.mined_signatures.len() >= num_required
    }

    pub fn has_enough_bitcoin_signatures(&self, num_required: usize) -> bool {
        self.signed_psbt
            .as_ref()
            .map(|psbt| signer_count(psbt) >= num_required)
            .unwrap_or(false)
    }

    /// All transfers at `Mined` status means the batch is terminal and may
    /// be dropped from "current pending batch" consideration (§3).
    pub fn is_terminal(&self) -> bool {
        !self.transfers.is_empty()
            && self
                .transfers
                .iter()
                .all(|t| t.status == crate::domain::transfer::TransferStatus::Mined)
    }

    pub fn to_dto(&self) -> Result<TransferBatchDto> {
        Ok(TransferBatchDto {
            transfers: self.transfers.clone(),
            sending_signatures: self.sending_signatures.iter().map(|s| s.to_string()).collect(),
            sending_signers: self.sending_signers.clone(),
            mined_signatures: self.mined_signatures.iter().map(|s| s.to_string()).collect(),
            mined_signers: self.mined_signers.clone(),
            bitcoin_tx_hash: self.bitcoin_tx_hash,
            initial_psbt: encode_psbt(&self.initial_psbt),
            signed_psbt: self.signed_psbt.as_ref().map(encode_psbt),
        })
    }

    pub fn from_dto(dto: TransferBatchDto) -> Result<Self> {
        let sending_signatures = dto
            .sending_signatures
            .iter()
            .map(|s| parse_signature(s))
            .collect::<Result<Vec<_>>>()?;
        let mined_signatures = dto
            .mined_signatures
            .iter()
            .map(|s| parse_signature(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            transfers: dto.transfers,
            sending_signatures,
            sending_signers: dto.sending_signers,
            mined_signatures,
            mined_signers: dto.mined_signers,
            bitcoin_tx_hash: dto.bitcoin_tx_hash,
            initial_psbt: decode_psbt(&dto.initial_psbt)?,
            signed_psbt: dto.signed_psbt.as_deref().map(decode_psbt).transpose()?,
        })
    }
}

fn signer_count(psbt: &Psbt) -> usize {
    psbt.inputs
        .iter()
        .map(|input| input.partial_sigs.len())
        .min()
        .unwrap_or(0)
}

pub fn encode_psbt(psbt: &Psbt) -> String {
    base64::engine::general_purpose::STANDARD.encode(psbt.serialize())
}

pub fn decode_psbt(encoded: &str) -> Result<Psbt> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::Bitcoin(format!("invalid psbt base64: {e}")))?;
    Psbt::deserialize(&bytes).map_err(|e| Error::Bitcoin(format!("invalid psbt bytes: {e}")))
}

pub fn parse_signature(s: &str) -> Result<Signature> {
    s.parse()
        .map_err(|e| Error::Crypto(format!("invalid signature {s}: {e}")))
}

/// Persisted / wire snapshot of a [`TransferBatch`] (§3, §4.3, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferBatchDto {
    pub transfers: Vec<Transfer>,
    pub sending_signatures: Vec<String>,
    pub sending_signers: Vec<Address>,
    pub mined_signatures: Vec<String>,
    pub mined_signers: Vec<Address>,
    pub bitcoin_tx_hash: H256,
    pub initial_psbt: String,
    pub signed_psbt: Option<String>,
}

impl TransferBatchDto {
    pub fn transfer_ids(&self) -> Vec<TransferId> {
        self.transfers.iter().map(|t| t.transfer_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::fixtures::sample_unsigned_psbt;

    #[test]
    fn dto_round_trip_is_identity() {
        let psbt = sample_unsigned_psbt();
        let batch = TransferBatch::new(Vec::new(), H256::zero(), psbt);
        let dto = batch.to_dto().unwrap();
        let restored = TransferBatch::from_dto(dto.clone()).unwrap();
        let dto2 = restored.to_dto().unwrap();
        assert_eq!(dto.initial_psbt, dto2.initial_psbt);
        assert_eq!(dto.bitcoin_tx_hash, dto2.bitcoin_tx_hash);
    }

    #[test]
    fn identity_is_sorted_transfer_ids() {
        let t1 = Transfer::new(
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into(),
            1,
            1000,
            "0xa".into(),
            H256::zero(),
            0,
            1,
        )
        .unwrap();
        let t2 = Transfer::new(
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".into(),
            2,
            1000,
            "0xa".into(),
            H256::zero(),
            0,
            2,
        )
        .unwrap();
        let psbt = sample_unsigned_psbt();
        let batch_a = TransferBatch::new(vec![t1.clone(), t2.clone()], H256::zero(), psbt.clone());
        let batch_b = TransferBatch::new(vec![t2, t1], H256::zero(), psbt);
        assert_eq!(batch_a.identity(), batch_b.identity());
    }
}
