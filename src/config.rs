use crate::errors::{BuslinkError, Result};
use crate::transaction::TransportTransactionMode;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

/// Environment variable holding the transport connection string.
pub const ENV_CONNECTION_STRING: &str = "BUSLINK_CONNECTION";

/// Environment variable holding the license text, if any.
pub const ENV_LICENSE: &str = "BUSLINK_LICENSE";

/// Environment variable holding the hosting app's name. Hashed into a
/// deterministic instance identity for addressing purposes.
pub const ENV_APP_NAME: &str = "BUSLINK_APP_NAME";

/// Key looked up in the structured settings map for the connection string.
pub const CONNECTION_SETTING_KEY: &str = "connection_string";

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// Frozen endpoint configuration, consumed at startup by the endpoint
/// lifecycle manager and opaque to the processing core thereafter.
///
/// # Example
///
/// ```rust
/// use buslink::{EndpointConfig, TransportTransactionMode};
///
/// let config = EndpointConfig::builder("orders")
///     .connection_string("Endpoint=sb://example/;SharedAccessKey=...")
///     .transaction_mode(TransportTransactionMode::SendsAtomicWithReceive)
///     .immediate_retries(3)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.name(), "orders");
/// ```
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    name: String,
    connection_string: String,
    transaction_mode: TransportTransactionMode,
    immediate_retries: u32,
    delayed_retries: u32,
    error_queue: String,
    route_failures_to_error_queue: bool,
    send_only: bool,
    outbox_enabled: bool,
    diagnostics: bool,
    license: Option<String>,
    instance_id: String,
}

impl EndpointConfig {
    /// Start building a configuration for the named endpoint.
    pub fn builder(name: impl Into<String>) -> EndpointConfigBuilder {
        EndpointConfigBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn transaction_mode(&self) -> TransportTransactionMode {
        self.transaction_mode
    }

    pub fn immediate_retries(&self) -> u32 {
        self.immediate_retries
    }

    pub fn delayed_retries(&self) -> u32 {
        self.delayed_retries
    }

    pub fn error_queue(&self) -> &str {
        &self.error_queue
    }

    /// Whether exhausted messages are moved to the error queue. When `false`
    /// the error pipeline reports failures back as retry-required and the
    /// original error surfaces as a hard function failure.
    pub fn route_failures_to_error_queue(&self) -> bool {
        self.route_failures_to_error_queue
    }

    pub fn send_only(&self) -> bool {
        self.send_only
    }

    pub fn outbox_enabled(&self) -> bool {
        self.outbox_enabled
    }

    pub fn diagnostics(&self) -> bool {
        self.diagnostics
    }

    pub fn license(&self) -> Option<&str> {
        self.license.as_deref()
    }

    /// Deterministic identity derived from the hosting app's name (or the
    /// endpoint name when no app name is configured). Stable across restarts
    /// so addresses derived from it do not drift.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`EndpointConfig`].
#[derive(Debug, Clone)]
pub struct EndpointConfigBuilder {
    name: String,
    connection_string: Option<String>,
    settings: HashMap<String, String>,
    transaction_mode: TransportTransactionMode,
    immediate_retries: u32,
    delayed_retries: u32,
    error_queue: String,
    route_failures_to_error_queue: bool,
    send_only: bool,
    outbox_enabled: bool,
    diagnostics: bool,
}

impl EndpointConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: None,
            settings: HashMap::new(),
            transaction_mode: TransportTransactionMode::default(),
            immediate_retries: 5,
            delayed_retries: 3,
            error_queue: "error".to_string(),
            route_failures_to_error_queue: true,
            send_only: false,
            outbox_enabled: false,
            diagnostics: false,
        }
    }

    /// Set the transport connection string explicitly. Takes precedence over
    /// the settings map and the environment variable.
    pub fn connection_string(mut self, value: impl Into<String>) -> Self {
        self.connection_string = Some(value.into());
        self
    }

    /// Add a structured-configuration setting. The `connection_string` key is
    /// consulted when no explicit connection string is given.
    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Set the transport transaction mode. Defaults to
    /// [`TransportTransactionMode::ReceiveOnly`] so immediate retries stay
    /// cheap.
    pub fn transaction_mode(mut self, mode: TransportTransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Number of immediate retries before delayed retries kick in.
    pub fn immediate_retries(mut self, n: u32) -> Self {
        self.immediate_retries = n;
        self
    }

    /// Number of delayed-retry rounds before the message is exhausted.
    pub fn delayed_retries(mut self, n: u32) -> Self {
        self.delayed_retries = n;
        self
    }

    /// Name of the error queue exhausted messages are moved to.
    pub fn error_queue(mut self, name: impl Into<String>) -> Self {
        self.error_queue = name.into();
        self
    }

    /// Disable moving exhausted messages to the error queue. Failures then
    /// surface as hard function failures instead.
    pub fn do_not_send_messages_to_error_queue(mut self) -> Self {
        self.route_failures_to_error_queue = false;
        self
    }

    /// Configure the endpoint as send-only: it can send and publish but never
    /// processes incoming messages.
    pub fn send_only(mut self) -> Self {
        self.send_only = true;
        self
    }

    /// Enable the pipeline's durable outbox feature. Incompatible with
    /// [`TransportTransactionMode::SendsAtomicWithReceive`]; the combination
    /// is rejected before any message is processed.
    pub fn enable_outbox(mut self) -> Self {
        self.outbox_enabled = true;
        self
    }

    /// Emit startup diagnostics.
    pub fn enable_diagnostics(mut self) -> Self {
        self.diagnostics = true;
        self
    }

    /// Resolve, validate and freeze the configuration.
    ///
    /// Fails fast with an actionable message when the connection string is
    /// missing from all three supply paths.
    pub fn build(self) -> Result<EndpointConfig> {
        self.build_with_env(|key| std::env::var(key).ok())
    }

    /// `build` with an injected environment lookup. Lets tests exercise the
    /// resolution order without mutating process-wide state.
    pub fn build_with_env(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<EndpointConfig> {
        let connection_string = self
            .connection_string
            .filter(|s| !s.is_empty())
            .or_else(|| self.settings.get(CONNECTION_SETTING_KEY).filter(|s| !s.is_empty()).cloned())
            .or_else(|| env(ENV_CONNECTION_STRING).filter(|s| !s.is_empty()))
            .ok_or_else(|| {
                BuslinkError::Config(format!(
                    "connection string is required: pass it to connection_string(), \
                     add the '{}' setting, or set the {} environment variable",
                    CONNECTION_SETTING_KEY, ENV_CONNECTION_STRING
                ))
            })?;

        let license = env(ENV_LICENSE).filter(|s| !s.is_empty());

        let identity_source = env(ENV_APP_NAME)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.name.clone());
        let instance_id =
            uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, identity_source.as_bytes()).to_string();

        Ok(EndpointConfig {
            name: self.name,
            connection_string,
            transaction_mode: self.transaction_mode,
            immediate_retries: self.immediate_retries,
            delayed_retries: self.delayed_retries,
            error_queue: self.error_queue,
            route_failures_to_error_queue: self.route_failures_to_error_queue,
            send_only: self.send_only,
            outbox_enabled: self.outbox_enabled,
            diagnostics: self.diagnostics,
            license,
            instance_id,
        })
    }
}
