//! Settings persistence.
//!
//! Everything durable lives in one TOML file: node behaviour, the
//! instance identity (including the RSA keypair), network ports, display
//! policy, and the paired-master trust records.  `config` owns the file;
//! `trust` adapts its `paired_masters` table to the [`TrustStore`] trait.
//!
//! [`TrustStore`]: stagelink_core::TrustStore

pub mod config;
pub mod trust;
