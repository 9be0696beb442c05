//! Vault capability wire types and configuration.

use serde::{Deserialize, Serialize};

use donflow_ports::CapabilityConfiguration;

use crate::error::{SecretsError, SecretsResult};
use crate::threshold::PublicKey;

/// Capability ID of the vault DON.
pub const VAULT_CAPABILITY_ID: &str = "vault@1.0.0";
/// Method fetching a batch of secrets.
pub const GET_SECRETS_METHOD: &str = "GetSecrets";

const PUBLIC_KEY_FIELD: &str = "VaultPublicKey";
const THRESHOLD_FIELD: &str = "Threshold";

/// Fully qualified secret name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretIdentifier {
    /// Secret key.
    pub key: String,
    /// Namespace.
    pub namespace: String,
    /// Canonical owner address.
    pub owner: String,
}

impl SecretIdentifier {
    /// `owner::namespace::key`, the lookup key of a response.
    #[must_use]
    pub fn composite(&self) -> String {
        format!("{}::{}::{}", self.owner, self.namespace, self.key)
    }
}

/// One secret in a vault request, with the keys its shares are sealed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRequestItem {
    /// Which secret.
    pub id: SecretIdentifier,
    /// Hex X25519 keys of the workflow DON members.
    pub encryption_keys: Vec<String>,
}

/// Body of a `GetSecrets` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSecretsVaultRequest {
    /// Requested secrets.
    pub requests: Vec<SecretRequestItem>,
}

/// Shares sealed to one workflow node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedShares {
    /// Hex key the shares are sealed to.
    pub encryption_key: String,
    /// Hex sealed boxes, one per vault node.
    pub shares: Vec<String>,
}

/// A secret as the vault returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretData {
    /// Hex threshold ciphertext.
    pub encrypted_value: String,
    /// Shares grouped by recipient.
    pub encrypted_decryption_key_shares: Vec<EncryptedShares>,
}

/// Per-secret outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretResult {
    /// The secret and its shares.
    Data(SecretData),
    /// Why the vault could not serve it.
    Error(String),
}

/// One answered secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretResponseItem {
    /// Which secret.
    pub id: SecretIdentifier,
    /// Outcome.
    pub result: SecretResult,
}

/// Body of a `GetSecrets` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSecretsVaultResponse {
    /// Answers, in any order.
    pub responses: Vec<SecretResponseItem>,
}

/// Vault settings read from the capability's DON configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Group key the secrets are sealed to.
    pub public_key: PublicKey,
    /// Shares needed to decrypt.
    pub threshold: usize,
}

impl VaultConfig {
    /// Read `VaultPublicKey` (hex) and `Threshold` from `config`.
    pub fn from_capability_config(config: &CapabilityConfiguration) -> SecretsResult<Self> {
        let fields = &config.default_config;
        let threshold = fields
            .get(THRESHOLD_FIELD)
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();
        if threshold <= 0 {
            return Err(SecretsError::Config(
                "invalid Threshold in the capability config".into(),
            ));
        }
        let threshold = usize::try_from(threshold)
            .map_err(|_| SecretsError::Config("invalid Threshold in the capability config".into()))?;

        let encoded = fields
            .get(PUBLIC_KEY_FIELD)
            .and_then(serde_json::Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                SecretsError::Config("VaultPublicKey is not provided in the capability config".into())
            })?;
        let bytes = hex::decode(encoded).map_err(SecretsError::encoding)?;
        Ok(Self {
            public_key: PublicKey::from_bytes(&bytes)?,
            threshold,
        })
    }

    /// The inverse of [`VaultConfig::from_capability_config`].
    pub fn to_capability_config(&self) -> SecretsResult<CapabilityConfiguration> {
        Ok(CapabilityConfiguration {
            default_config: serde_json::json!({
                PUBLIC_KEY_FIELD: hex::encode(self.public_key.to_bytes()?),
                THRESHOLD_FIELD: self.threshold,
            }),
        })
    }
}
