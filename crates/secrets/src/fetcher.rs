//! Secrets fetcher backed by the vault capability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use donflow_core::{ExecutionId, WorkflowId};
use donflow_limits::ResourcePoolLimiter;
use donflow_ports::{
    CapabilitiesRegistry, CapabilityRequest, GetSecretsRequest, PortsError, RequestMetadata,
    SecretResponse, SecretsFetcher,
};
use donflow_telemetry::{InMemoryTelemetry, Labels, TelemetryService, labels, metrics};

use crate::error::{SecretsError, SecretsResult};
use crate::threshold::{Ciphertext, DecryptionShare};
use crate::vault::{
    GET_SECRETS_METHOD, GetSecretsVaultRequest, GetSecretsVaultResponse, SecretData,
    SecretIdentifier, SecretRequestItem, SecretResult, VAULT_CAPABILITY_ID, VaultConfig,
};
use crate::workflow_key::WorkflowKey;

const ADDRESS_HEX_LEN: usize = 40;

/// Resolves secrets through the vault DON and decrypts them locally.
///
/// One instance serves one workflow. Every fetch takes a unit from the
/// shared secrets concurrency pool for the duration of the vault round trip
/// and the decryption that follows.
pub struct VaultSecretsFetcher {
    registry: Arc<dyn CapabilitiesRegistry>,
    key: Arc<WorkflowKey>,
    concurrency: Arc<ResourcePoolLimiter>,
    telemetry: Arc<dyn TelemetryService>,
    owner: String,
    workflow_id: String,
    workflow_name: String,
    labels: Labels,
}

impl VaultSecretsFetcher {
    /// Fetcher for `owner`'s workflows using this node's `key`.
    pub fn new(
        registry: Arc<dyn CapabilitiesRegistry>,
        key: Arc<WorkflowKey>,
        concurrency: Arc<ResourcePoolLimiter>,
        owner: impl Into<String>,
    ) -> Self {
        let owner = owner.into();
        Self {
            registry,
            key,
            concurrency,
            telemetry: Arc::new(InMemoryTelemetry::new()),
            labels: Labels::new().with(labels::WORKFLOW_OWNER, &owner),
            owner,
            workflow_id: String::new(),
            workflow_name: String::new(),
        }
    }

    /// Attach the workflow the fetches run for.
    #[must_use]
    pub fn with_workflow(mut self, workflow_id: &WorkflowId, name: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.to_string();
        self.workflow_name = name.into();
        self.labels.insert(labels::WORKFLOW_ID, &self.workflow_id);
        self.labels.insert(labels::WORKFLOW_NAME, &self.workflow_name);
        self
    }

    /// Report fetch durations to `telemetry`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryService>) -> Self {
        self.telemetry = telemetry;
        self
    }

    async fn fetch(
        &self,
        execution_id: &ExecutionId,
        request: GetSecretsRequest,
    ) -> SecretsResult<Vec<SecretResponse>> {
        let owner = normalize_owner(&self.owner)?;

        let vault = self
            .registry
            .get_executable(VAULT_CAPABILITY_ID)
            .await
            .map_err(|e| SecretsError::port("failed to get vault capability", e))?;
        let info = vault
            .info()
            .await
            .map_err(|e| SecretsError::port("failed to get vault capability info", e))?;
        let local = self
            .registry
            .local_node()
            .await
            .map_err(|e| SecretsError::port("failed to get local node", e))?;

        let vault_don = if info.is_local {
            local.workflow_don.id
        } else {
            info.don
                .as_ref()
                .map(|don| don.id)
                .ok_or_else(|| SecretsError::Config("vault capability has no DON".into()))?
        };
        let capability_config = self
            .registry
            .config_for_capability(VAULT_CAPABILITY_ID, vault_don)
            .await
            .map_err(|e| SecretsError::port("failed to get vault capability config", e))?;
        let config = VaultConfig::from_capability_config(&capability_config)?;

        let my_key = self.key.public_key_hex();
        let mut member_keys = Vec::with_capacity(local.workflow_don.members.len());
        for peer_id in &local.workflow_don.members {
            let node = self
                .registry
                .node_by_peer_id(peer_id)
                .await
                .map_err(|e| SecretsError::port("failed to get DON member", e))?;
            member_keys.push(hex::encode(node.encryption_public_key));
        }
        member_keys.sort();

        let ids: Vec<SecretIdentifier> = request
            .requests
            .iter()
            .map(|secret| SecretIdentifier {
                key: secret.id.clone(),
                namespace: secret.namespace_or_default().to_owned(),
                owner: owner.clone(),
            })
            .collect();
        let vault_request = GetSecretsVaultRequest {
            requests: ids
                .iter()
                .map(|id| SecretRequestItem {
                    id: id.clone(),
                    encryption_keys: member_keys.clone(),
                })
                .collect(),
        };

        let response = vault
            .execute(CapabilityRequest {
                capability_id: VAULT_CAPABILITY_ID.to_owned(),
                method: GET_SECRETS_METHOD.to_owned(),
                payload: serde_json::to_value(&vault_request).map_err(SecretsError::encoding)?,
                config: serde_json::Value::Null,
                metadata: RequestMetadata {
                    workflow_id: self.workflow_id.clone(),
                    workflow_owner: owner.clone(),
                    workflow_execution_id: vault_execution_id(execution_id, request.callback_id),
                    workflow_name: self.workflow_name.clone(),
                    workflow_don_id: local.workflow_don.id,
                    ..RequestMetadata::default()
                },
            })
            .await
            .map_err(|e| SecretsError::port("failed to call vault capability", e))?;
        let response: GetSecretsVaultResponse =
            serde_json::from_value(response.payload).map_err(SecretsError::encoding)?;

        let by_id: HashMap<String, &SecretResult> = response
            .responses
            .iter()
            .map(|item| (item.id.composite(), &item.result))
            .collect();

        Ok(ids
            .into_iter()
            .map(|id| {
                let result = match by_id.get(&id.composite()) {
                    None => Err(format!("could not find response for the request: {}", id.key)),
                    Some(SecretResult::Error(e)) => Err(format!("secret request returned an error: {e}")),
                    Some(SecretResult::Data(data)) => self
                        .decrypt(&config, data, &my_key)
                        .map_err(|e| e.to_string()),
                };
                if let Err(e) = &result {
                    warn!(secret = %id.key, namespace = %id.namespace, error = %e, "secret not resolved");
                }
                SecretResponse {
                    id: id.key,
                    namespace: id.namespace,
                    owner: id.owner,
                    result,
                }
            })
            .collect())
    }

    fn decrypt(&self, config: &VaultConfig, data: &SecretData, my_key: &str) -> SecretsResult<String> {
        let sealed_shares = data
            .encrypted_decryption_key_shares
            .iter()
            .find(|group| group.encryption_key.eq_ignore_ascii_case(my_key))
            .map(|group| &group.shares)
            .ok_or_else(|| {
                SecretsError::Config(format!("no shares found for this node's encryption key: {my_key}"))
            })?;

        let raw = hex::decode(&data.encrypted_value).map_err(SecretsError::encoding)?;
        let ciphertext = Ciphertext::from_bytes(&raw)?;
        config.public_key.verify_ciphertext(&ciphertext)?;

        let mut shares = Vec::with_capacity(sealed_shares.len());
        for (position, sealed) in sealed_shares.iter().enumerate() {
            match self.open_share(config, &ciphertext, sealed) {
                Ok(share) => shares.push(share),
                Err(e) => debug!(position, error = %e, "skipping decryption share"),
            }
        }

        let plaintext = config.public_key.aggregate(&ciphertext, &shares, config.threshold)?;
        String::from_utf8(plaintext).map_err(|_| SecretsError::encoding("secret is not valid UTF-8"))
    }

    fn open_share(
        &self,
        config: &VaultConfig,
        ciphertext: &Ciphertext,
        sealed: &str,
    ) -> SecretsResult<DecryptionShare> {
        let sealed = hex::decode(sealed).map_err(SecretsError::encoding)?;
        let share = DecryptionShare::from_bytes(&self.key.open(&sealed)?)?;
        config.public_key.verify_share(ciphertext, &share)?;
        Ok(share)
    }
}

#[async_trait]
impl SecretsFetcher for VaultSecretsFetcher {
    async fn get_secrets(
        &self,
        execution_id: &ExecutionId,
        request: GetSecretsRequest,
    ) -> Result<Vec<SecretResponse>, PortsError> {
        let permit = self.concurrency.wait(1).await.map_err(SecretsError::from)?;
        let started = Instant::now();
        let result = self.fetch(execution_id, request).await;
        permit.free();

        self.telemetry
            .metrics()
            .histogram_with(metrics::SECRETS_FETCH_DURATION_MS, &self.labels)
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        Ok(result?)
    }
}

/// Canonical owner form: `0x` followed by the trailing 40 lowercase hex digits.
pub fn normalize_owner(owner: &str) -> SecretsResult<String> {
    let digits = owner
        .strip_prefix("0x")
        .or_else(|| owner.strip_prefix("0X"))
        .unwrap_or(owner);
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SecretsError::InvalidOwner("not hex".into()));
    }
    if digits.len() < ADDRESS_HEX_LEN {
        return Err(SecretsError::InvalidOwner("too short".into()));
    }
    let tail = &digits[digits.len() - ADDRESS_HEX_LEN..];
    Ok(format!("0x{}", tail.to_ascii_lowercase()))
}

/// Execution ID the vault sees: distinct per callback within one execution.
fn vault_execution_id(execution_id: &ExecutionId, callback_id: i32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(execution_id.as_str().as_bytes());
    hasher.update(callback_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
