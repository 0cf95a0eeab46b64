//! The wire envelope and the twelve message payloads federators exchange
//! (§4.6 "Message envelope").

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::domain::batch::TransferBatchDto;

/// Handshake protocol version (§4.6 "Authentication").
pub const HANDSHAKE_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub source_node_id: String,
    pub data: Message,
}

impl Envelope {
    pub fn new(source_node_id: impl Into<String>, message: Message) -> Self {
        Self {
            kind: message.type_name().to_string(),
            source_node_id: source_node_id.into(),
            data: message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    #[serde(rename = "request-sending-signature")]
    RequestSendingSignature { dto: TransferBatchDto },
    #[serde(rename = "sending-signature-response")]
    SendingSignatureResponse {
        dto: TransferBatchDto,
        address: Address,
        signature: String,
    },
    #[serde(rename = "request-bitcoin-signature")]
    RequestBitcoinSignature { dto: TransferBatchDto },
    #[serde(rename = "bitcoin-signature-response")]
    BitcoinSignatureResponse { dto: TransferBatchDto, signed_psbt: String },
    #[serde(rename = "request-mined-signature")]
    RequestMinedSignature { dto: TransferBatchDto },
    #[serde(rename = "mined-signature-response")]
    MinedSignatureResponse {
        dto: TransferBatchDto,
        address: Address,
        signature: String,
    },
    #[serde(rename = "initiator:sync-request")]
    InitiatorSyncRequest { initiator_id: String },
    #[serde(rename = "initiator:sync-response")]
    InitiatorSyncResponse { initiator_id: String },
    #[serde(rename = "request-replenish-signature")]
    RequestReplenishSignature {
        psbt: String,
        period_index: u64,
        times_in_period: u32,
    },
    #[serde(rename = "replenish-signature-response")]
    ReplenishSignatureResponse { psbt: String },
    #[serde(rename = "request-cpfp-signature")]
    RequestCpfpSignature {
        dto: TransferBatchDto,
        cpfp_tx: String,
        request_id: String,
    },
    #[serde(rename = "cpfp-signature-response")]
    CpfpSignatureResponse { cpfp_tx: String, request_id: String },
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::RequestSendingSignature { .. } => "request-sending-signature",
            Message::SendingSignatureResponse { .. } => "sending-signature-response",
            Message::RequestBitcoinSignature { .. } => "request-bitcoin-signature",
            Message::BitcoinSignatureResponse { .. } => "bitcoin-signature-response",
            Message::RequestMinedSignature { .. } => "request-mined-signature",
            Message::MinedSignatureResponse { .. } => "mined-signature-response",
            Message::InitiatorSyncRequest { .. } => "initiator:sync-request",
            Message::InitiatorSyncResponse { .. } => "initiator:sync-response",
            Message::RequestReplenishSignature { .. } => "request-replenish-signature",
            Message::ReplenishSignatureResponse { .. } => "replenish-signature-response",
            Message::RequestCpfpSignature { .. } => "request-cpfp-signature",
            Message::CpfpSignatureResponse { .. } => "cpfp-signature-response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::fixtures::sample_unsigned_psbt;
    use ethers::types::H256;

    #[test]
    fn envelope_round_trips_through_json() {
        let batch = crate::domain::batch::TransferBatch::new(Vec::new(), H256::zero(), sample_unsigned_psbt());
        let dto = batch.to_dto().unwrap();
        let envelope = Envelope::new("node-a", Message::RequestSendingSignature { dto });
        let json = serde_json::to_string(&envelope).unwrap();
        let restored: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.kind, "request-sending-signature");
        assert_eq!(restored.source_node_id, "node-a");
    }
}
