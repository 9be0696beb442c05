//! Fetcher tests against an in-process vault DON.
//!
//! The fake vault holds the real threshold key shares and answers
//! `GetSecrets` the way vault nodes do: one ciphertext per secret plus
//! decryption shares sealed to every requested workflow-node key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rand_core::OsRng;

use donflow_core::{ExecutionId, Scope};
use donflow_limits::{Limiter, ResourcePoolLimiter};
use donflow_ports::{
    CapabilitiesRegistry, CapabilityConfiguration, CapabilityInfo, CapabilityRequest,
    CapabilityResponse, CapabilityType, Don, ExecutableCapability, GetSecretsRequest, Node,
    PortsError, ResponseMetadata, SecretRequest, SecretsFetcher, TriggerCapability,
};
use donflow_secrets::vault::{
    EncryptedShares, GetSecretsVaultRequest, GetSecretsVaultResponse, SecretData,
    SecretResponseItem, SecretResult,
};
use donflow_secrets::{
    PrivateShare, PublicKey, VAULT_CAPABILITY_ID, VaultConfig, VaultSecretsFetcher, WorkflowKey,
    generate_keys,
};
use donflow_telemetry::{InMemoryTelemetry, Labels, TelemetryService, labels, metrics};

const OWNER: &str = "0xABABABABABABABABABABABABABABABABABABABAB";
const CANONICAL_OWNER: &str = "0xabababababababababababababababababababab";
const VAULT_DON: u32 = 7;
const WORKFLOW_DON: u32 = 1;

/// Call log shared between the fakes and the assertions.
#[derive(Default)]
struct Recorder(Mutex<Vec<String>>);

impl Recorder {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Fake vault
// ---------------------------------------------------------------------------

/// How the vault answers one secret key.
#[derive(Clone)]
enum Plan {
    /// Serve `value` with shares from the first `shares` key holders.
    Serve { value: String, shares: usize },
    /// Serve `value`, but seal the shares to a key nobody in the DON holds.
    ForeignKeyOnly { value: String },
    /// Report an error for the item.
    Fail(String),
    /// Leave the item out of the response.
    Omit,
}

struct FakeVault {
    public_key: PublicKey,
    key_shares: Vec<PrivateShare>,
    plans: HashMap<String, Plan>,
    calls: Recorder,
}

impl FakeVault {
    fn sealed_shares(
        &self,
        ciphertext: &donflow_secrets::Ciphertext,
        count: usize,
        recipient: &str,
    ) -> Vec<String> {
        let recipient: [u8; 32] = hex::decode(recipient).unwrap().try_into().unwrap();
        self.key_shares
            .iter()
            .take(count)
            .map(|share| {
                let share = share
                    .decryption_share(&self.public_key, ciphertext, &mut OsRng)
                    .unwrap();
                let sealed = WorkflowKey::seal(&recipient, &share.to_bytes().unwrap()).unwrap();
                hex::encode(sealed)
            })
            .collect()
    }

    fn answer(&self, value: &str, shares: usize, keys: &[String]) -> SecretResult {
        let ciphertext = self.public_key.encrypt(value.as_bytes(), &mut OsRng).unwrap();
        SecretResult::Data(SecretData {
            encrypted_value: hex::encode(ciphertext.to_bytes().unwrap()),
            encrypted_decryption_key_shares: keys
                .iter()
                .map(|key| EncryptedShares {
                    encryption_key: key.clone(),
                    shares: self.sealed_shares(&ciphertext, shares, key),
                })
                .collect(),
        })
    }
}

#[async_trait]
impl ExecutableCapability for FakeVault {
    async fn info(&self) -> Result<CapabilityInfo, PortsError> {
        Ok(CapabilityInfo {
            id: VAULT_CAPABILITY_ID.into(),
            capability_type: CapabilityType::Action,
            is_local: false,
            don: Some(Don {
                id: VAULT_DON,
                members: vec![],
                f: 1,
            }),
        })
    }

    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse, PortsError> {
        self.calls.push(format!(
            "{} owner={}",
            request.method, request.metadata.workflow_owner
        ));
        let body: GetSecretsVaultRequest = serde_json::from_value(request.payload)?;
        let mut responses = Vec::new();
        for item in body.requests {
            let result = match self.plans.get(&item.id.key).cloned().unwrap_or(Plan::Omit) {
                Plan::Serve { value, shares } => self.answer(&value, shares, &item.encryption_keys),
                Plan::ForeignKeyOnly { value } => {
                    let stranger = WorkflowKey::generate().public_key_hex();
                    self.answer(&value, self.key_shares.len(), &[stranger])
                }
                Plan::Fail(e) => SecretResult::Error(e),
                Plan::Omit => continue,
            };
            responses.push(SecretResponseItem {
                id: item.id,
                result,
            });
        }
        Ok(CapabilityResponse {
            payload: serde_json::to_value(GetSecretsVaultResponse { responses })?,
            metadata: ResponseMetadata::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fake registry
// ---------------------------------------------------------------------------

struct FakeRegistry {
    vault: Arc<FakeVault>,
    vault_config: CapabilityConfiguration,
    nodes: HashMap<String, Node>,
    config_lookups: Recorder,
}

#[async_trait]
impl CapabilitiesRegistry for FakeRegistry {
    async fn local_node(&self) -> Result<Node, PortsError> {
        Ok(self.nodes["peer-a"].clone())
    }

    async fn get_trigger(&self, id: &str) -> Result<Arc<dyn TriggerCapability>, PortsError> {
        Err(PortsError::not_found("trigger capability", id))
    }

    async fn get_executable(&self, id: &str) -> Result<Arc<dyn ExecutableCapability>, PortsError> {
        if id == VAULT_CAPABILITY_ID {
            Ok(self.vault.clone() as Arc<dyn ExecutableCapability>)
        } else {
            Err(PortsError::not_found("capability", id))
        }
    }

    async fn config_for_capability(
        &self,
        capability_id: &str,
        don_id: u32,
    ) -> Result<CapabilityConfiguration, PortsError> {
        self.config_lookups.push(format!("{capability_id}@{don_id}"));
        Ok(self.vault_config.clone())
    }

    async fn node_by_peer_id(&self, peer_id: &str) -> Result<Node, PortsError> {
        self.nodes
            .get(peer_id)
            .cloned()
            .ok_or_else(|| PortsError::not_found("node", peer_id))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    registry: Arc<FakeRegistry>,
    fetcher: VaultSecretsFetcher,
    telemetry: Arc<InMemoryTelemetry>,
    pool: Arc<ResourcePoolLimiter>,
}

fn harness(threshold: usize, total: usize, plans: &[(&str, Plan)]) -> Harness {
    harness_with_config(threshold, total, plans, None)
}

fn harness_with_config(
    threshold: usize,
    total: usize,
    plans: &[(&str, Plan)],
    config: Option<serde_json::Value>,
) -> Harness {
    let (public_key, key_shares) = generate_keys(threshold, total, &mut OsRng).unwrap();
    let vault_config = match config {
        Some(default_config) => CapabilityConfiguration { default_config },
        None => VaultConfig {
            public_key: public_key.clone(),
            threshold,
        }
        .to_capability_config()
        .unwrap(),
    };

    let my_key = Arc::new(WorkflowKey::generate());
    let peer_key = WorkflowKey::generate();
    let don = Don {
        id: WORKFLOW_DON,
        members: vec!["peer-b".into(), "peer-a".into()],
        f: 0,
    };
    let nodes = HashMap::from([
        (
            "peer-a".to_owned(),
            Node {
                peer_id: "peer-a".into(),
                workflow_don: don.clone(),
                encryption_public_key: my_key.public_key(),
            },
        ),
        (
            "peer-b".to_owned(),
            Node {
                peer_id: "peer-b".into(),
                workflow_don: don,
                encryption_public_key: peer_key.public_key(),
            },
        ),
    ]);

    let vault = Arc::new(FakeVault {
        public_key,
        key_shares,
        plans: plans
            .iter()
            .map(|(key, plan)| ((*key).to_owned(), plan.clone()))
            .collect(),
        calls: Recorder::default(),
    });
    let registry = Arc::new(FakeRegistry {
        vault,
        vault_config,
        nodes,
        config_lookups: Recorder::default(),
    });

    let telemetry = Arc::new(InMemoryTelemetry::new());
    let pool = Arc::new(ResourcePoolLimiter::new(
        "PerWorkflow.SecretsConcurrencyLimit",
        Scope::Workflow,
        "wf",
        5,
    ));
    let fetcher = VaultSecretsFetcher::new(registry.clone(), my_key, pool.clone(), OWNER)
        .with_telemetry(telemetry.clone());
    Harness {
        registry,
        fetcher,
        telemetry,
        pool,
    }
}

fn request(keys: &[&str]) -> GetSecretsRequest {
    GetSecretsRequest {
        requests: keys.iter().map(|key| SecretRequest::new(*key, "")).collect(),
        callback_id: 1,
    }
}

fn serve(value: &str, shares: usize) -> Plan {
    Plan::Serve {
        value: value.into(),
        shares,
    }
}

fn exec_id() -> ExecutionId {
    ExecutionId::new("exec-1")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quorum_of_shares_reveals_the_secret() {
    let h = harness(2, 4, &[("API_KEY", serve("s3cret", 3))]);

    let responses = h
        .fetcher
        .get_secrets(&exec_id(), request(&["API_KEY"]))
        .await
        .unwrap();

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, "API_KEY");
    assert_eq!(responses[0].namespace, "main");
    assert_eq!(responses[0].owner, CANONICAL_OWNER);
    assert_eq!(responses[0].result, Ok("s3cret".to_owned()));

    assert_eq!(h.registry.config_lookups.entries(), vec![format!("{VAULT_CAPABILITY_ID}@{VAULT_DON}")]);
    assert_eq!(
        h.registry.vault.calls.entries(),
        vec![format!("GetSecrets owner={CANONICAL_OWNER}")]
    );
    assert_eq!(h.pool.available(), 5);
    assert_eq!(
        h.telemetry
            .metrics()
            .histogram_with(
                metrics::SECRETS_FETCH_DURATION_MS,
                &Labels::new().with(labels::WORKFLOW_OWNER, OWNER)
            )
            .count(),
        1
    );
}

#[tokio::test]
async fn one_short_secret_does_not_spoil_the_batch() {
    let h = harness(
        3,
        4,
        &[
            ("A", serve("alpha", 4)),
            ("B", serve("beta", 2)),
            ("C", serve("gamma", 3)),
        ],
    );

    let responses = h
        .fetcher
        .get_secrets(&exec_id(), request(&["A", "B", "C"]))
        .await
        .unwrap();

    let results: Vec<_> = responses.iter().map(|r| (r.id.as_str(), r.result.clone())).collect();
    assert_eq!(
        results,
        vec![
            ("A", Ok("alpha".to_owned())),
            (
                "B",
                Err("not enough decryption shares to decrypt the secret: have 2, need at least 3".to_owned())
            ),
            ("C", Ok("gamma".to_owned())),
        ]
    );
    assert_eq!(h.registry.vault.calls.entries().len(), 1);
}

#[tokio::test]
async fn missing_and_failed_items_error_individually() {
    let h = harness(
        1,
        2,
        &[
            ("GONE", Plan::Omit),
            ("DENIED", Plan::Fail("access denied".into())),
            ("ELSEWHERE", Plan::ForeignKeyOnly { value: "x".into() }),
            ("OK", serve("fine", 1)),
        ],
    );

    let responses = h
        .fetcher
        .get_secrets(&exec_id(), request(&["GONE", "DENIED", "ELSEWHERE", "OK"]))
        .await
        .unwrap();

    assert_eq!(
        responses[0].result,
        Err("could not find response for the request: GONE".to_owned())
    );
    assert_eq!(
        responses[1].result,
        Err("secret request returned an error: access denied".to_owned())
    );
    let elsewhere = responses[2].result.clone().unwrap_err();
    assert!(
        elsewhere.starts_with("no shares found for this node's encryption key"),
        "{elsewhere}"
    );
    assert_eq!(responses[3].result, Ok("fine".to_owned()));
}

#[tokio::test]
async fn explicit_namespace_is_kept() {
    let h = harness(1, 1, &[("TOKEN", serve("t", 1))]);

    let responses = h
        .fetcher
        .get_secrets(
            &exec_id(),
            GetSecretsRequest {
                requests: vec![SecretRequest::new("TOKEN", "ops")],
                callback_id: 9,
            },
        )
        .await
        .unwrap();

    assert_eq!(responses[0].namespace, "ops");
    assert_eq!(responses[0].result, Ok("t".to_owned()));
}

#[tokio::test]
async fn bad_vault_config_fails_the_whole_batch() {
    let h = harness_with_config(
        1,
        1,
        &[("API_KEY", serve("x", 1))],
        Some(serde_json::json!({ "VaultPublicKey": "00", "Threshold": 0 })),
    );

    let err = h
        .fetcher
        .get_secrets(&exec_id(), request(&["API_KEY"]))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("invalid Threshold in the capability config"), "{err}");
    assert!(h.registry.vault.calls.entries().is_empty());
    assert_eq!(h.pool.available(), 5);
}

#[tokio::test]
async fn closed_pool_rejects_fetches() {
    let h = harness(1, 1, &[("API_KEY", serve("x", 1))]);
    h.pool.close().unwrap();

    let err = h
        .fetcher
        .get_secrets(&exec_id(), request(&["API_KEY"]))
        .await
        .unwrap_err();

    assert!(matches!(err, PortsError::Limit(_)));
}
