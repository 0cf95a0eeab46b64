//! Signing primitives for the two chains this node talks to.
//!
//! Sidechain messages are signed with the standard Ethereum personal-message
//! (EIP-191) convention via [`ethers`]; Bitcoin inputs are signed through the
//! BIP32 extended key held by [`keystore::FederatorKeystore`]. The two key
//! materials are independent — a federator's sidechain address and its
//! Bitcoin multisig key need not (and generally don't) derive from the same
//! seed.

pub mod eip191;
pub mod keystore;

pub use eip191::{eip191_hash, recover_address, sign_message};
pub use keystore::FederatorKeystore;
