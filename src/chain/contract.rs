//! Generated bindings for the sidechain bridge contract (§6 "Chain contract
//! expectations"). The ABI only covers the surface this node actually calls.

use ethers::contract::abigen;

abigen!(
    FastBtcBridge,
    r#"[
        function getTransfer(string, uint8) external view returns (address, uint8, uint8, uint8, uint256, uint256, string)
        function federators() external view returns (address[])
        function getTransferBatchUpdateHashWithTxHash(bytes32, bytes32[], uint8) external view returns (bytes32)
        function getTransferBatchUpdateHash(bytes32[], uint8) external view returns (bytes32)
        function markTransfersAsSending(bytes32, bytes32[], bytes[]) external
        function markTransfersAsMined(bytes32[], bytes[]) external
        event NewTransfer(bytes32 indexed transferId, string btcAddress, uint8 nonce, uint256 amountSat, address indexed from)
        event TransferStatusUpdated(bytes32 indexed transferId, uint8 status)
    ]"#,
);

/// `newStatus` values accepted by `getTransferBatchUpdateHash{,WithTxHash}`
/// and produced by `getTransfer`/`TransferStatusUpdated` (§6).
pub const STATUS_NEW: u8 = 0;
pub const STATUS_SENDING: u8 = 1;
pub const STATUS_MINED: u8 = 2;
pub const STATUS_REFUNDED: u8 = 3;
pub const STATUS_RECLAIMED: u8 = 4;
