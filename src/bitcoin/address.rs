//! Derivation of the M-of-N P2WSH multisig address from a sorted tuple of
//! extended public keys at a fixed BIP32 path (§4.2).

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::script::Builder;
use bitcoin::{Address, Network, PublicKey, ScriptBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct MultisigAddress {
    pub address: Address,
    pub witness_script: ScriptBuf,
    pub required_signers: usize,
    pub total_signers: usize,
}

impl MultisigAddress {
    /// Derive the canonical multisig address from `xpubs` (any order — they
    /// are sorted here so every federator derives the identical script
    /// regardless of the order its config lists them in) at `path`.
    pub fn derive(
        xpubs: &[String],
        path: &str,
        required_signers: usize,
        network: Network,
    ) -> Result<Self> {
        if required_signers == 0 || required_signers > xpubs.len() {
            return Err(Error::Config(format!(
                "required_signers {required_signers} out of range for {} keys",
                xpubs.len()
            )));
        }
        if xpubs.len() > 15 {
            return Err(Error::Config(
                "bare multisig scripts support at most 15 public keys".into(),
            ));
        }

        let derivation_path = DerivationPath::from_str(path)
            .map_err(|e| Error::Config(format!("invalid derivation path {path}: {e}")))?;

        let mut derived_pubkeys: Vec<PublicKey> = xpubs
            .iter()
            .map(|xpub_str| derive_pubkey(xpub_str, &derivation_path))
            .collect::<Result<Vec<_>>>()?;
        // Sort the derived public keys (BIP67-style) so the resulting script
        // is identical no matter what order the config lists federators in.
        derived_pubkeys.sort_by_key(|pk| pk.to_bytes());

        let witness_script = multisig_script(required_signers, &derived_pubkeys)?;
        let address = Address::p2wsh(&witness_script, network);

        Ok(Self {
            address,
            witness_script,
            required_signers,
            total_signers: xpubs.len(),
        })
    }
}

fn derive_pubkey(xpub_str: &str, path: &DerivationPath) -> Result<PublicKey> {
    let xpub = Xpub::from_str(xpub_str.trim())
        .map_err(|e| Error::Config(format!("invalid extended public key {xpub_str}: {e}")))?;
    let secp = bitcoin::secp256k1::Secp256k1::verification_only();
    let children: Vec<ChildNumber> = path.as_ref().to_vec();
    let derived = xpub
        .derive_pub(&secp, &children)
        .map_err(|e| Error::Config(format!("derivation failed for {xpub_str}: {e}")))?;
    Ok(PublicKey::new(derived.public_key))
}

fn multisig_script(required_signers: usize, pubkeys: &[PublicKey]) -> Result<ScriptBuf> {
    use bitcoin::opcodes::all::OP_CHECKMULTISIG;
    let m = required_signers as i64;
    let n = pubkeys.len() as i64;
    let mut builder = Builder::new().push_int(m);
    for pk in pubkeys {
        builder = builder.push_key(pk);
    }
    builder = builder.push_int(n);
    Ok(builder.push_opcode(OP_CHECKMULTISIG).into_script())
}

#[cfg(test)]
mod tests {
    use super::*;

    const XPUB_A: &str = "tpubD6NzVbkrYhZ4WZaiWHz59q5EQ61an1VRBYtVPPX9EcA9pcT2iYXP3BR5fxRT7UKLz3AfZvBbpoLPucc8mDH2MgAr8ZGKGhcQtHXM8p3ZzR5";
    const XPUB_B: &str = "tpubD6NzVbkrYhZ4Wkp9ubeCVtAq9mx7nt3o3PCvJ2vt8ZzHDh7C85q3jZ1ZYiK9dWSEHM9j49qHvaFmfhZgTQXHwvR1g5yMoq8joiBdBDdCnzf";
    const XPUB_C: &str = "tpubD6NzVbkrYhZ4YAJtDbiVLtjHHmKq43CcoPsStcxYCDZ4w5b9rGXf6LqqJzLCxvzJvxiBUq6FQc7qjbyjrcM8ex9oX2fL4tk4Lp5PxqEHmEc";

    #[test]
    fn derivation_is_order_independent() {
        let path = "m/0";
        let a = MultisigAddress::derive(
            &[XPUB_A.to_string(), XPUB_B.to_string(), XPUB_C.to_string()],
            path,
            2,
            Network::Testnet,
        );
        let b = MultisigAddress::derive(
            &[XPUB_C.to_string(), XPUB_A.to_string(), XPUB_B.to_string()],
            path,
            2,
            Network::Testnet,
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.address, b.address);
    }

    #[test]
    fn rejects_m_greater_than_n() {
        let result = MultisigAddress::derive(&[XPUB_A.to_string()], "m/0", 2, Network::Testnet);
        assert!(result.is_err());
    }
}
