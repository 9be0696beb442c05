//! Engine configuration.
//!
//! [`EngineConfig`] collects everything one engine instance needs: the
//! module, the ports it reaches out through, the limiter sets and the hooks.
//! [`EngineConfig::validate`] checks it once and produces the
//! [`ValidatedConfig`] the engine runs on.

use std::sync::Arc;
use std::time::Duration;

use donflow_core::{Clock, SystemClock, Tenant, WorkflowId, WorkflowOwner};
use donflow_limits::{ScopedRateLimiter, ScopedResourceLimiter};
use donflow_metering::BillingClient;
use donflow_ports::{CapabilitiesRegistry, DonTimeProvider, Module, OrgResolver, SecretsFetcher};
use donflow_secrets::{VaultSecretsFetcher, WorkflowKey};
use donflow_telemetry::{InMemoryTelemetry, TelemetryService};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hooks::{LifecycleHooks, NoopHooks};
use crate::limiters::EngineLimiters;
use crate::time::LocalTimeProvider;

const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine-local timings. A zero value means the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Interval between heartbeats.
    #[serde(with = "humantime_serde")]
    pub heartbeat_frequency: Duration,
    /// How long `close` waits for in-flight executions.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl EngineLimits {
    /// Replace zero values with defaults.
    #[must_use]
    pub fn normalized(self) -> Self {
        let or_default = |value: Duration, default| if value.is_zero() { default } else { value };
        Self {
            heartbeat_frequency: or_default(self.heartbeat_frequency, DEFAULT_HEARTBEAT_FREQUENCY),
            shutdown_timeout: or_default(self.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT),
        }
    }
}

/// Unvalidated engine configuration.
///
/// Built with [`EngineConfig::new`] and the `with_*` setters:
///
/// ```ignore
/// let config = EngineConfig::new(workflow_id, owner, "price-feed")
///     .with_module(module)
///     .with_registry(registry)
///     .with_local_time_provider()
///     .with_limiters(limiters)
///     .with_global_limiters(concurrency, rate)
///     .with_secrets_fetcher(fetcher);
/// ```
pub struct EngineConfig {
    /// Workflow ID, 64 hex digits.
    pub workflow_id: String,
    /// Workflow owner address, 40 hex digits.
    pub workflow_owner: String,
    /// Human-readable workflow name.
    pub workflow_name: String,
    /// Workflow tag carried in capability request metadata.
    pub workflow_tag: String,
    /// Configuration blob handed to the module on every call.
    pub workflow_config: Vec<u8>,

    /// The workflow program.
    pub module: Option<Arc<dyn Module>>,
    /// Capability and DON lookup.
    pub registry: Option<Arc<dyn CapabilitiesRegistry>>,
    /// Source of DON-agreed time.
    pub don_time: Option<Arc<dyn DonTimeProvider>>,
    /// Serve the local clock as DON time instead of `don_time`.
    pub use_local_time_provider: bool,
    /// Clock for enqueue stamps, staleness and node time.
    pub clock: Arc<dyn Clock>,

    /// Secrets fetcher; defaults to a vault fetcher using `encryption_key`.
    pub secrets_fetcher: Option<Arc<dyn SecretsFetcher>>,
    /// This node's workflow key.
    pub encryption_key: Option<Arc<WorkflowKey>>,

    /// Engine-local timings.
    pub limits: EngineLimits,
    /// Per-workflow limiters.
    pub limiters: Option<EngineLimiters>,
    /// Node-wide workflow slots, scoped per owner.
    pub global_concurrency: Option<Arc<ScopedResourceLimiter>>,
    /// Node-wide execution rate, scoped per owner.
    pub global_rate: Option<Arc<ScopedRateLimiter>>,

    /// Event and metric sink.
    pub telemetry: Arc<dyn TelemetryService>,
    /// Lifecycle callbacks.
    pub hooks: Arc<dyn LifecycleHooks>,
    /// Billing service; `None` meters without credits.
    pub billing_client: Option<Arc<dyn BillingClient>>,
    /// Maps the owner to a billing organization.
    pub org_resolver: Option<Arc<dyn OrgResolver>>,
    /// Workflow registry contract address.
    pub registry_address: String,
    /// Chain selector of the workflow registry, decimal.
    pub registry_chain_selector: String,

    /// Log every execution result.
    pub debug_mode: bool,
}

impl EngineConfig {
    /// Configuration for one workflow with every optional part unset.
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_owner: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_owner: workflow_owner.into(),
            workflow_name: workflow_name.into(),
            workflow_tag: String::new(),
            workflow_config: Vec::new(),
            module: None,
            registry: None,
            don_time: None,
            use_local_time_provider: false,
            clock: SystemClock::arc(),
            secrets_fetcher: None,
            encryption_key: None,
            limits: EngineLimits::default(),
            limiters: None,
            global_concurrency: None,
            global_rate: None,
            telemetry: InMemoryTelemetry::arc(),
            hooks: Arc::new(NoopHooks),
            billing_client: None,
            org_resolver: None,
            registry_address: String::new(),
            registry_chain_selector: String::new(),
            debug_mode: false,
        }
    }

    /// Set the module.
    #[must_use]
    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.module = Some(module);
        self
    }

    /// Set the capabilities registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn CapabilitiesRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the DON time provider.
    #[must_use]
    pub fn with_don_time(mut self, don_time: Arc<dyn DonTimeProvider>) -> Self {
        self.don_time = Some(don_time);
        self
    }

    /// Serve the local clock as DON time.
    #[must_use]
    pub fn with_local_time_provider(mut self) -> Self {
        self.use_local_time_provider = true;
        self
    }

    /// Set the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the workflow configuration blob.
    #[must_use]
    pub fn with_workflow_config(mut self, config: impl Into<Vec<u8>>) -> Self {
        self.workflow_config = config.into();
        self
    }

    /// Set the workflow tag.
    #[must_use]
    pub fn with_workflow_tag(mut self, tag: impl Into<String>) -> Self {
        self.workflow_tag = tag.into();
        self
    }

    /// Use `fetcher` for secrets.
    #[must_use]
    pub fn with_secrets_fetcher(mut self, fetcher: Arc<dyn SecretsFetcher>) -> Self {
        self.secrets_fetcher = Some(fetcher);
        self
    }

    /// Fetch secrets from the vault with this node's `key`.
    #[must_use]
    pub fn with_encryption_key(mut self, key: Arc<WorkflowKey>) -> Self {
        self.encryption_key = Some(key);
        self
    }

    /// Set the engine-local timings.
    #[must_use]
    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the per-workflow limiters.
    #[must_use]
    pub fn with_limiters(mut self, limiters: EngineLimiters) -> Self {
        self.limiters = Some(limiters);
        self
    }

    /// Set the node-wide limiters shared by every engine.
    #[must_use]
    pub fn with_global_limiters(
        mut self,
        concurrency: Arc<ScopedResourceLimiter>,
        rate: Arc<ScopedRateLimiter>,
    ) -> Self {
        self.global_concurrency = Some(concurrency);
        self.global_rate = Some(rate);
        self
    }

    /// Set the telemetry sink.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryService>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Set the lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the billing client.
    #[must_use]
    pub fn with_billing_client(mut self, client: Arc<dyn BillingClient>) -> Self {
        self.billing_client = Some(client);
        self
    }

    /// Set the organization resolver.
    #[must_use]
    pub fn with_org_resolver(mut self, resolver: Arc<dyn OrgResolver>) -> Self {
        self.org_resolver = Some(resolver);
        self
    }

    /// Set where the workflow is registered.
    #[must_use]
    pub fn with_registry_location(
        mut self,
        address: impl Into<String>,
        chain_selector: impl Into<String>,
    ) -> Self {
        self.registry_address = address.into();
        self.registry_chain_selector = chain_selector.into();
        self
    }

    /// Log every execution result.
    #[must_use]
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Check the configuration, reporting the first missing or malformed field.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let module = self.module.ok_or(ConfigError::ModuleNotSet)?;
        let registry = self.registry.ok_or(ConfigError::RegistryNotSet)?;
        let don_time: Arc<dyn DonTimeProvider> = if self.use_local_time_provider {
            Arc::new(LocalTimeProvider::new(Arc::clone(&self.clock)))
        } else {
            self.don_time.ok_or(ConfigError::DonTimeNotSet)?
        };
        let workflow_id: WorkflowId = self.workflow_id.parse().map_err(ConfigError::InvalidWorkflowId)?;
        let workflow_owner: WorkflowOwner = self
            .workflow_owner
            .parse()
            .map_err(ConfigError::InvalidWorkflowOwner)?;
        if self.workflow_name.is_empty() {
            return Err(ConfigError::WorkflowNameNotSet);
        }
        let limiters = self.limiters.ok_or(ConfigError::LimitersNotSet)?;
        let global_concurrency = self
            .global_concurrency
            .ok_or(ConfigError::ConcurrencyLimiterNotSet)?;
        let global_rate = self.global_rate.ok_or(ConfigError::RateLimiterNotSet)?;

        let secrets_fetcher: Arc<dyn SecretsFetcher> = match (self.secrets_fetcher, self.encryption_key) {
            (Some(fetcher), _) => fetcher,
            (None, Some(key)) => Arc::new(
                VaultSecretsFetcher::new(
                    Arc::clone(&registry),
                    key,
                    Arc::clone(&limiters.secrets_concurrency),
                    workflow_owner.to_prefixed(),
                )
                .with_workflow(&workflow_id, &self.workflow_name)
                .with_telemetry(Arc::clone(&self.telemetry)),
            ),
            (None, None) => return Err(ConfigError::EncryptionKeyNotSet),
        };

        Ok(ValidatedConfig {
            tenant: Tenant::workflow(workflow_owner, workflow_id),
            workflow_id,
            workflow_owner,
            workflow_name: self.workflow_name,
            workflow_tag: self.workflow_tag,
            workflow_config: self.workflow_config,
            module,
            registry,
            don_time,
            clock: self.clock,
            secrets_fetcher,
            limits: self.limits.normalized(),
            limiters,
            global_concurrency,
            global_rate,
            telemetry: self.telemetry,
            hooks: self.hooks,
            billing_client: self.billing_client,
            org_resolver: self.org_resolver,
            registry_address: self.registry_address,
            registry_chain_selector: self.registry_chain_selector,
            debug_mode: self.debug_mode,
        })
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("workflow_id", &self.workflow_id)
            .field("workflow_owner", &self.workflow_owner)
            .field("workflow_name", &self.workflow_name)
            .field("limits", &self.limits)
            .field("debug_mode", &self.debug_mode)
            .finish_non_exhaustive()
    }
}

/// A checked [`EngineConfig`].
pub struct ValidatedConfig {
    pub(crate) workflow_id: WorkflowId,
    pub(crate) workflow_owner: WorkflowOwner,
    pub(crate) tenant: Tenant,
    pub(crate) workflow_name: String,
    pub(crate) workflow_tag: String,
    pub(crate) workflow_config: Vec<u8>,
    pub(crate) module: Arc<dyn Module>,
    pub(crate) registry: Arc<dyn CapabilitiesRegistry>,
    pub(crate) don_time: Arc<dyn DonTimeProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) secrets_fetcher: Arc<dyn SecretsFetcher>,
    pub(crate) limits: EngineLimits,
    pub(crate) limiters: EngineLimiters,
    pub(crate) global_concurrency: Arc<ScopedResourceLimiter>,
    pub(crate) global_rate: Arc<ScopedRateLimiter>,
    pub(crate) telemetry: Arc<dyn TelemetryService>,
    pub(crate) hooks: Arc<dyn LifecycleHooks>,
    pub(crate) billing_client: Option<Arc<dyn BillingClient>>,
    pub(crate) org_resolver: Option<Arc<dyn OrgResolver>>,
    pub(crate) registry_address: String,
    pub(crate) registry_chain_selector: String,
    pub(crate) debug_mode: bool,
}

impl ValidatedConfig {
    /// The workflow ID.
    #[must_use]
    pub const fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// The workflow owner.
    #[must_use]
    pub const fn workflow_owner(&self) -> &WorkflowOwner {
        &self.workflow_owner
    }

    /// The engine-local timings, zeros replaced by defaults.
    #[must_use]
    pub const fn limits(&self) -> &EngineLimits {
        &self.limits
    }
}

impl std::fmt::Debug for ValidatedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedConfig")
            .field("workflow_id", &self.workflow_id)
            .field("workflow_owner", &self.workflow_owner)
            .field("workflow_name", &self.workflow_name)
            .field("limits", &self.limits)
            .field("limiters", &self.limiters)
            .finish_non_exhaustive()
    }
}
