//! Identity module containing the RSA keypair primitives trust is built on.

pub mod keys;

pub use keys::{fingerprint, generate_challenge, generate_keypair, sign, verify, KeyError, Keypair};
