//! Fixed test vectors used both by the startup early-tx-hash sanity check
//! (§4.2.1, §9) and by unit tests across the crate.

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Network, OutPoint, Txid};
use ethers::types::H256;

use crate::bitcoin::address::MultisigAddress;
use crate::bitcoin::psbt::{build_unsigned_psbt, BuildPsbtParams, Utxo};
use crate::domain::transfer::Transfer;

const FIXTURE_XPUBS: [&str; 3] = [
    "tpubD6NzVbkrYhZ4WZaiWHz59q5EQ61an1VRBYtVPPX9EcA9pcT2iYXP3BR5fxRT7UKLz3AfZvBbpoLPucc8mDH2MgAr8ZGKGhcQtHXM8p3ZzR5",
    "tpubD6NzVbkrYhZ4Wkp9ubeCVtAq9mx7nt3o3PCvJ2vt8ZzHDh7C85q3jZ1ZYiK9dWSEHM9j49qHvaFmfhZgTQXHwvR1g5yMoq8joiBdBDdCnzf",
    "tpubD6NzVbkrYhZ4YAJtDbiVLtjHHmKq43CcoPsStcxYCDZ4w5b9rGXf6LqqJzLCxvzJvxiBUq6FQc7qjbyjrcM8ex9oX2fL4tk4Lp5PxqEHmEc",
];

pub fn sample_multisig() -> MultisigAddress {
    MultisigAddress::derive(
        &FIXTURE_XPUBS.map(String::from),
        "m/0",
        2,
        Network::Regtest,
    )
    .expect("fixture multisig derivation must succeed")
}

pub fn sample_transfer(nonce: u8, amount_sat: u64) -> Transfer {
    Transfer::new(
        "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string(),
        nonce,
        amount_sat,
        "0x000000000000000000000000000000000000aa".to_string(),
        H256::zero(),
        0,
        100,
    )
    .expect("fixture transfer must be valid")
}

pub fn sample_utxo(multisig: &MultisigAddress, amount_sat: u64, confirmations: u32) -> Utxo {
    Utxo {
        outpoint: OutPoint {
            txid: Txid::from_byte_array([7u8; 32]),
            vout: 0,
        },
        amount: bitcoin::Amount::from_sat(amount_sat),
        confirmations,
        script_pubkey: multisig.address.script_pubkey(),
    }
}

/// The fixed test vector the startup check builds and inspects (§9): a
/// one-input, one-payment-output, one-change-output PSBT over the fixture
/// multisig, used to confirm signing never perturbs the unsigned txid.
pub fn sample_unsigned_psbt() -> bitcoin::psbt::Psbt {
    let multisig = sample_multisig();
    let transfer = sample_transfer(0, 100_000);
    let utxo = sample_utxo(&multisig, 10_000_000, 6);
    build_unsigned_psbt(BuildPsbtParams {
        utxos: &[utxo],
        transfers: &[transfer],
        multisig: &multisig,
        fee_sat_per_vbyte: 10,
        no_change: false,
        max_inputs: None,
    })
    .expect("fixture psbt construction must succeed")
}

/// A 2-of-3 multisig whose private keys are derivable, for use in the
/// startup check (§4.2.1, §9), which must actually sign its fixture rather
/// than merely construct it. Unlike [`FIXTURE_XPUBS`], these keys are
/// generated fresh each run from fixed seeds rather than hardcoded, so the
/// corresponding private keys stay available.
pub fn fixture_signing_material() -> (Vec<Xpriv>, MultisigAddress) {
    let secp = Secp256k1::new();
    let xprivs: Vec<Xpriv> = (0u8..3)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = b'E'; // "early-tx-hash" fixture seed, distinct per signer.
            seed[1] = i;
            Xpriv::new_master(Network::Regtest, &seed).expect("fixture master key derivation must succeed")
        })
        .collect();
    let xpubs: Vec<String> = xprivs.iter().map(|xpriv| Xpub::from_priv(&secp, xpriv).to_string()).collect();
    let multisig =
        MultisigAddress::derive(&xpubs, "m/0", 2, Network::Regtest).expect("fixture multisig derivation must succeed");
    (xprivs, multisig)
}

/// The PSBT signed by [`fixture_signing_material`]'s keys (§9).
pub fn signable_sample_psbt(multisig: &MultisigAddress) -> bitcoin::psbt::Psbt {
    let transfer = sample_transfer(0, 100_000);
    let utxo = sample_utxo(multisig, 10_000_000, 6);
    build_unsigned_psbt(BuildPsbtParams {
        utxos: &[utxo],
        transfers: &[transfer],
        multisig,
        fee_sat_per_vbyte: 10,
        no_change: false,
        max_inputs: None,
    })
    .expect("fixture psbt construction must succeed")
}
