//! EIP-191 personal-message hashing, signing, and recovery.
//!
//! Every signed artefact exchanged between federators — sending signatures,
//! mined signatures — is produced and verified through this module so the
//! `"\x19Ethereum Signed Message:\n" <len> <msg>` prefix is applied exactly
//! once, in exactly one place.

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256};
use ethers::utils::hash_message;

use crate::error::{Error, Result};

/// The EIP-191 personal-message digest of `message`.
pub fn eip191_hash(message: impl AsRef<[u8]>) -> H256 {
    hash_message(message)
}

/// Sign `message` (the raw update-hash bytes, *not* pre-hashed) with the
/// given local wallet, applying the EIP-191 prefix.
pub async fn sign_message(wallet: &LocalWallet, message: impl AsRef<[u8]>) -> Result<Signature> {
    wallet
        .sign_message(message.as_ref())
        .await
        .map_err(|e| Error::Crypto(format!("signing failed: {e}")))
}

/// Recover the signing address from a message + signature, applying the
/// EIP-191 prefix exactly as the chain contract's `ecrecover` usage does.
pub fn recover_address(message: impl AsRef<[u8]>, signature: &Signature) -> Result<Address> {
    signature
        .recover(message.as_ref())
        .map_err(|e| Error::Crypto(format!("recovery failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_and_recover_round_trip() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let message = b"transfer-batch-update-hash";
        let signature = sign_message(&wallet, message).await.unwrap();
        let recovered = recover_address(message, &signature).unwrap();
        assert_eq!(recovered, wallet.address());
    }

    #[tokio::test]
    async fn different_messages_recover_different_addresses_for_same_signature() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let signature = sign_message(&wallet, b"message-a").await.unwrap();
        let recovered_a = recover_address(b"message-a", &signature).unwrap();
        let recovered_b = recover_address(b"message-b", &signature).unwrap();
        assert_eq!(recovered_a, wallet.address());
        assert_ne!(recovered_b, wallet.address());
    }
}
