#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # donflow Secrets
//!
//! Threshold-encrypted secrets for workflow executions.
//!
//! Secrets live in a vault DON sealed to a group key no single node holds.
//! On a fetch each vault node returns a decryption share sealed to the
//! requesting node's [`WorkflowKey`]; the [`VaultSecretsFetcher`] opens and
//! verifies the shares addressed to it and combines a quorum of them.
//!
//! - [`threshold`] -- key generation, encryption, shares, aggregation
//! - [`WorkflowKey`] -- X25519 sealed boxes for shares in transit
//! - [`vault`] -- vault capability wire types and configuration
//! - [`VaultSecretsFetcher`] -- the [`SecretsFetcher`](donflow_ports::SecretsFetcher) implementation

pub mod error;
pub mod fetcher;
pub mod threshold;
pub mod vault;
pub mod workflow_key;

pub use error::{SecretsError, SecretsResult};
pub use fetcher::{VaultSecretsFetcher, normalize_owner};
pub use threshold::{Ciphertext, DecryptionShare, PrivateShare, PublicKey, generate_keys};
pub use vault::{VAULT_CAPABILITY_ID, VaultConfig};
pub use workflow_key::WorkflowKey;
