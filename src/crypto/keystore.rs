//! Custody of the node's two signing keys: the sidechain (secp256k1/EIP-191)
//! key and the Bitcoin BIP32 extended private key used for the node's share
//! of the P2WSH multisig.
//!
//! Both are loaded once at startup from environment variables (§6) and held
//! for the life of the process; the hex-encoded bytes are zeroized as soon as
//! they've been parsed into their typed form.

use bitcoin::bip32::Xpriv;
use bitcoin::Network;
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub struct FederatorKeystore {
    sidechain_wallet: LocalWallet,
    bitcoin_xpriv: Xpriv,
}

impl FederatorKeystore {
    /// Load both keys from the environment. `sidechain_key_env` names the env
    /// var holding the sidechain private key as 0x-prefixed or bare hex;
    /// `bitcoin_xpriv_env` names the one holding the Bitcoin extended private
    /// key in standard base58 `xprv`/`tprv` form.
    pub fn from_env(sidechain_key_env: &str, bitcoin_xpriv_env: &str, network: Network) -> Result<Self> {
        let sidechain_hex = Zeroizing::new(
            std::env::var(sidechain_key_env)
                .map_err(|_| Error::Config(format!("missing env var {sidechain_key_env}")))?,
        );
        let trimmed = sidechain_hex.trim_start_matches("0x");
        let sidechain_wallet = LocalWallet::from_str(trimmed)
            .map_err(|e| Error::Crypto(format!("invalid sidechain private key: {e}")))?;

        let bitcoin_xpriv_str = Zeroizing::new(
            std::env::var(bitcoin_xpriv_env)
                .map_err(|_| Error::Config(format!("missing env var {bitcoin_xpriv_env}")))?,
        );
        let bitcoin_xpriv = Xpriv::from_str(bitcoin_xpriv_str.trim())
            .map_err(|e| Error::Crypto(format!("invalid bitcoin xpriv: {e}")))?;
        if bitcoin_xpriv.network != network.into() {
            return Err(Error::Config(
                "bitcoin xpriv network does not match configured network".into(),
            ));
        }

        Ok(Self {
            sidechain_wallet,
            bitcoin_xpriv,
        })
    }

    pub fn sidechain_wallet(&self) -> &LocalWallet {
        &self.sidechain_wallet
    }

    pub fn sidechain_address(&self) -> Address {
        use ethers::signers::Signer;
        self.sidechain_wallet.address()
    }

    pub fn bitcoin_xpriv(&self) -> &Xpriv {
        &self.bitcoin_xpriv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_keys_from_env() {
        std::env::set_var(
            "TEST_SIDECHAIN_KEY",
            "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362d1",
        );
        std::env::set_var(
            "TEST_BITCOIN_XPRIV",
            "tprv8ZgxMBicQKsPd7Uf69XL1XwhmjHopUGep8GuEiJDZmbQz6o58LninorQAfMhUsbSy4O73B2SsMv1GSYYW41fVaBdUhVx8xtS6Fvzh3bpCk2",
        );
        let keystore = FederatorKeystore::from_env(
            "TEST_SIDECHAIN_KEY",
            "TEST_BITCOIN_XPRIV",
            Network::Testnet,
        )
        .unwrap();
        assert_ne!(keystore.sidechain_address(), Address::zero());
    }

    #[test]
    fn rejects_network_mismatch() {
        std::env::set_var(
            "TEST_SIDECHAIN_KEY_2",
            "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362d1",
        );
        std::env::set_var(
            "TEST_BITCOIN_XPRIV_2",
            "tprv8ZgxMBicQKsPd7Uf69XL1XwhmjHopUGep8GuEiJDZmbQz6o58LninorQAfMhUsbSy4O73B2SsMv1GSYYW41fVaBdUhVx8xtS6Fvzh3bpCk2",
        );
        let result = FederatorKeystore::from_env(
            "TEST_SIDECHAIN_KEY_2",
            "TEST_BITCOIN_XPRIV_2",
            Network::Bitcoin,
        );
        assert!(result.is_err());
    }
}
