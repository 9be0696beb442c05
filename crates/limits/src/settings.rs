//! Declarative quota schema.
//!
//! Every quota the engine enforces is a [`Setting`]: a key, the [`Scope`] it
//! applies at, and a default. [`WorkflowSettings`] groups them by scope and is
//! the single source every limiter is built from. Operators adjust quotas with
//! [`SettingOverrides`], resolved workflow → owner → global → default.

use std::collections::BTreeMap;
use std::time::Duration;

use donflow_core::{Scope, Tenant};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{LimitError, LimitResult};

/// A duration that (de)serializes in human-readable form, e.g. `"15s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HumanDuration(#[serde(with = "humantime_serde")] pub Duration);

impl HumanDuration {
    /// Wrapped duration
    #[must_use]
    pub const fn get(self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

/// GCRA rate: sustained requests per second plus burst capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    /// Sustained rate
    pub per_second: u32,
    /// Requests allowed at once
    pub burst: u32,
}

/// One quota in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting<T> {
    /// Fully qualified key, e.g. `PerWorkflow.ExecutionTimeout`
    pub key: String,
    /// Level the quota applies at
    pub scope: Scope,
    /// Value used when no override matches
    pub default: T,
}

impl<T> Setting<T> {
    /// Create a setting named `name` under `scope`.
    pub fn new(scope: Scope, name: &str, default: T) -> Self {
        Self {
            key: format!("{}.{name}", scope.key_prefix()),
            scope,
            default,
        }
    }
}

/// Quotas shared by every workflow on the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Concurrently running workflow instances
    pub workflow_limit: Setting<u64>,
    /// Trigger executions per second across all workflows
    pub workflow_execution_rate: Setting<Rate>,
}

/// Quotas shared by every workflow of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerOwnerSettings {
    /// Concurrently running workflow instances of one owner
    pub workflow_limit: Setting<u64>,
    /// Trigger executions per second for one owner
    pub workflow_execution_rate: Setting<Rate>,
}

/// Quotas private to one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerWorkflowSettings {
    /// Largest response an execution may return, in bytes
    pub execution_response_limit: Setting<u64>,
    /// Deadline for the module subscribe call
    pub trigger_subscription_timeout: Setting<HumanDuration>,
    /// Deadline for registering with every trigger
    pub trigger_registrations_timeout: Setting<HumanDuration>,
    /// Maximum number of trigger subscriptions
    pub trigger_subscription_limit: Setting<u64>,
    /// Capacity of the trigger event queue
    pub trigger_event_queue_limit: Setting<u64>,
    /// Age after which a queued event is discarded
    pub trigger_event_queue_timeout: Setting<HumanDuration>,
    /// Concurrent executions
    pub execution_concurrency_limit: Setting<u64>,
    /// Uncompressed module binary size, in bytes
    pub wasm_binary_size_limit: Setting<u64>,
    /// Compressed module binary size, in bytes
    pub wasm_compressed_binary_size_limit: Setting<u64>,
    /// Module memory, in bytes
    pub wasm_memory_limit: Setting<u64>,
    /// Module response size, in bytes
    pub wasm_response_size_limit: Setting<u64>,
    /// Concurrent capability calls per execution
    pub capability_concurrency_limit: Setting<u64>,
    /// Concurrent secrets fetches
    pub secrets_concurrency_limit: Setting<u64>,
    /// Deadline for one execution
    pub execution_timeout: Setting<HumanDuration>,
    /// Deadline for one capability call
    pub capability_call_timeout: Setting<HumanDuration>,
    /// User log lines per execution
    pub log_event_limit: Setting<u64>,
    /// Length of one user log line, in bytes
    pub log_line_limit: Setting<u64>,
    /// Chain write calls per execution
    pub chain_write_target_limit: Setting<u64>,
    /// Chain read calls per execution
    pub chain_read_call_limit: Setting<u64>,
    /// Consensus calls per execution
    pub consensus_call_limit: Setting<u64>,
    /// HTTP action calls per execution
    pub http_action_call_limit: Setting<u64>,
}

/// The complete quota schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Node-wide quotas
    pub global: GlobalSettings,
    /// Per-owner quotas
    pub per_owner: PerOwnerSettings,
    /// Per-workflow quotas
    pub per_workflow: PerWorkflowSettings,
}

const fn secs(n: u64) -> HumanDuration {
    HumanDuration(Duration::from_secs(n))
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        use Scope::{Global, Owner, Workflow};
        Self {
            global: GlobalSettings {
                workflow_limit: Setting::new(Global, "WorkflowLimit", 1_000),
                workflow_execution_rate: Setting::new(
                    Global,
                    "WorkflowExecutionRateLimit",
                    Rate {
                        per_second: 200,
                        burst: 200,
                    },
                ),
            },
            per_owner: PerOwnerSettings {
                workflow_limit: Setting::new(Owner, "WorkflowLimit", 200),
                workflow_execution_rate: Setting::new(
                    Owner,
                    "WorkflowExecutionRateLimit",
                    Rate {
                        per_second: 20,
                        burst: 20,
                    },
                ),
            },
            per_workflow: PerWorkflowSettings {
                execution_response_limit: Setting::new(Workflow, "ExecutionResponseLimit", 100_000),
                trigger_subscription_timeout: Setting::new(
                    Workflow,
                    "TriggerSubscriptionTimeout",
                    secs(15),
                ),
                trigger_registrations_timeout: Setting::new(
                    Workflow,
                    "TriggerRegistrationsTimeout",
                    secs(10),
                ),
                trigger_subscription_limit: Setting::new(Workflow, "TriggerSubscriptionLimit", 10),
                trigger_event_queue_limit: Setting::new(Workflow, "TriggerEventQueueLimit", 1_000),
                trigger_event_queue_timeout: Setting::new(
                    Workflow,
                    "TriggerEventQueueTimeout",
                    secs(10 * 60),
                ),
                execution_concurrency_limit: Setting::new(Workflow, "ExecutionConcurrencyLimit", 5),
                wasm_binary_size_limit: Setting::new(Workflow, "WASMBinarySizeLimit", 100_000_000),
                wasm_compressed_binary_size_limit: Setting::new(
                    Workflow,
                    "WASMCompressedBinarySizeLimit",
                    20_000_000,
                ),
                wasm_memory_limit: Setting::new(Workflow, "WASMMemoryLimit", 100_000_000),
                wasm_response_size_limit: Setting::new(Workflow, "WASMResponseSizeLimit", 100_000),
                capability_concurrency_limit: Setting::new(
                    Workflow,
                    "CapabilityConcurrencyLimit",
                    3,
                ),
                secrets_concurrency_limit: Setting::new(Workflow, "SecretsConcurrencyLimit", 5),
                execution_timeout: Setting::new(Workflow, "ExecutionTimeout", secs(5 * 60)),
                capability_call_timeout: Setting::new(
                    Workflow,
                    "CapabilityCallTimeout",
                    secs(3 * 60),
                ),
                log_event_limit: Setting::new(Workflow, "LogEventLimit", 1_000),
                log_line_limit: Setting::new(Workflow, "LogLineLimit", 1_000),
                chain_write_target_limit: Setting::new(Workflow, "ChainWriteTargetLimit", 10),
                chain_read_call_limit: Setting::new(Workflow, "ChainReadCallLimit", 10),
                consensus_call_limit: Setting::new(Workflow, "ConsensusCallLimit", 2_000),
                http_action_call_limit: Setting::new(Workflow, "HTTPActionCallLimit", 5),
            },
        }
    }
}

/// Operator overrides, keyed by setting key.
///
/// Values are raw JSON so one map can carry numbers, rates, and
/// human-readable durations alike.
///
/// ```
/// use donflow_limits::SettingOverrides;
///
/// let overrides = SettingOverrides::from_json(
///     r#"{ "global": { "PerWorkflow.ExecutionTimeout": "30s" } }"#,
/// ).unwrap();
/// assert!(overrides.global.contains_key("PerWorkflow.ExecutionTimeout"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingOverrides {
    /// Overrides for everyone
    #[serde(default)]
    pub global: BTreeMap<String, serde_json::Value>,
    /// Overrides by owner hex
    #[serde(default)]
    pub owners: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    /// Overrides by workflow ID hex
    #[serde(default)]
    pub workflows: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl SettingOverrides {
    /// Parse overrides from a JSON document.
    pub fn from_json(json: &str) -> LimitResult<Self> {
        serde_json::from_str(json).map_err(|e| LimitError::invalid_setting("overrides", e.to_string()))
    }

    /// Override `key` for everyone.
    pub fn with_global(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.global.insert(key.into(), value);
        self
    }

    /// Override `key` for one owner.
    pub fn with_owner(
        mut self,
        owner: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.owners
            .entry(owner.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Override `key` for one workflow.
    pub fn with_workflow(
        mut self,
        workflow: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.workflows
            .entry(workflow.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Most specific override applicable to `setting` for `tenant`.
    ///
    /// Narrower levels are only consulted when the setting's own scope
    /// reaches them: a global quota ignores owner and workflow overrides.
    fn lookup(&self, key: &str, scope: Scope, tenant: &Tenant) -> Option<&serde_json::Value> {
        let by_workflow = (scope == Scope::Workflow)
            .then(|| {
                tenant
                    .workflow
                    .and_then(|w| self.workflows.get(&w.to_string()))
                    .and_then(|m| m.get(key))
            })
            .flatten();
        let by_owner = || {
            (scope != Scope::Global)
                .then(|| {
                    tenant
                        .owner
                        .and_then(|o| self.owners.get(&o.to_string()))
                        .and_then(|m| m.get(key))
                })
                .flatten()
        };
        by_workflow.or_else(by_owner).or_else(|| self.global.get(key))
    }

    /// Resolve the effective value of `setting` for `tenant`.
    pub fn resolve<T>(&self, setting: &Setting<T>, tenant: &Tenant) -> LimitResult<T>
    where
        T: DeserializeOwned + Clone,
    {
        match self.lookup(&setting.key, setting.scope, tenant) {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| LimitError::invalid_setting(&setting.key, e.to_string())),
            None => Ok(setting.default.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use donflow_core::{WorkflowId, WorkflowOwner};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tenant() -> Tenant {
        let owner: WorkflowOwner = "aa".repeat(20).parse().unwrap();
        let wf: WorkflowId = "bb".repeat(32).parse().unwrap();
        Tenant::workflow(owner, wf)
    }

    #[test]
    fn keys_carry_scope_prefix() {
        let s = WorkflowSettings::default();
        assert_eq!(s.per_workflow.trigger_subscription_limit.key, "PerWorkflow.TriggerSubscriptionLimit");
        assert_eq!(s.per_owner.workflow_limit.key, "PerOwner.WorkflowLimit");
        assert_eq!(s.global.workflow_limit.key, "Global.WorkflowLimit");
    }

    #[test]
    fn defaults_resolve_without_overrides() {
        let s = WorkflowSettings::default();
        let timeout = SettingOverrides::default()
            .resolve(&s.per_workflow.execution_timeout, &tenant())
            .unwrap();
        assert_eq!(timeout.get(), Duration::from_secs(300));
    }

    #[test]
    fn workflow_override_beats_owner_and_global() {
        let s = WorkflowSettings::default();
        let key = s.per_workflow.log_event_limit.key.clone();
        let overrides = SettingOverrides::default()
            .with_global(&key, json!(10))
            .with_owner("aa".repeat(20), &key, json!(20))
            .with_workflow("bb".repeat(32), &key, json!(30));
        assert_eq!(overrides.resolve(&s.per_workflow.log_event_limit, &tenant()).unwrap(), 30);

        let owner_only = Tenant::owner(tenant().owner.unwrap());
        assert_eq!(overrides.resolve(&s.per_workflow.log_event_limit, &owner_only).unwrap(), 20);
    }

    #[test]
    fn global_scope_ignores_narrower_overrides() {
        let s = WorkflowSettings::default();
        let key = s.global.workflow_limit.key.clone();
        let overrides = SettingOverrides::default().with_owner("aa".repeat(20), &key, json!(1));
        assert_eq!(overrides.resolve(&s.global.workflow_limit, &tenant()).unwrap(), 1_000);
    }

    #[test]
    fn human_durations_parse_from_overrides() {
        let s = WorkflowSettings::default();
        let overrides = SettingOverrides::from_json(
            r#"{ "global": { "PerWorkflow.TriggerEventQueueTimeout": "1m 30s" } }"#,
        )
        .unwrap();
        let age = overrides
            .resolve(&s.per_workflow.trigger_event_queue_timeout, &tenant())
            .unwrap();
        assert_eq!(age.get(), Duration::from_secs(90));
    }

    #[test]
    fn malformed_override_is_an_invalid_setting() {
        let s = WorkflowSettings::default();
        let key = s.per_workflow.log_event_limit.key.clone();
        let overrides = SettingOverrides::default().with_global(&key, json!("lots"));
        let err = overrides.resolve(&s.per_workflow.log_event_limit, &tenant()).unwrap_err();
        assert!(matches!(err, LimitError::InvalidSetting { key: k, .. } if k == key));
    }
}
