//! Connection options and lifecycle hooks.

use std::fmt;
use std::sync::Arc;

pub const DEFAULT_HOST: &str = "iot.arduino.cc";
pub const DEFAULT_API_URL: &str = "https://api2.arduino.cc/iot/v1/clients/token";
pub const DEFAULT_AUDIENCE: &str = "https://api2.arduino.cc/iot";

/// Port used by token and client-credential sessions when none is configured.
pub const USER_PORT: u16 = 8443;
/// Port used by device sessions when none is configured.
pub const DEVICE_PORT: u16 = 8884;

pub type Hook = Arc<dyn Fn() + Send + Sync>;
/// Called with the reason, when one is known.
pub type DisconnectHook = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Callbacks fired on connection lifecycle changes.
#[derive(Clone, Default)]
pub struct Hooks {
    /// After every successful connect, reconnect or token rotation.
    pub on_connected: Option<Hook>,
    /// When the transport drops unexpectedly.
    pub on_offline: Option<Hook>,
    /// When the transport closes without `disconnect` being called.
    pub on_disconnect: Option<DisconnectHook>,
}

impl Hooks {
    pub(crate) fn connected(&self) {
        if let Some(hook) = &self.on_connected {
            hook();
        }
    }

    pub(crate) fn offline(&self) {
        if let Some(hook) = &self.on_offline {
            hook();
        }
    }

    pub(crate) fn disconnected(&self, reason: Option<&str>) {
        if let Some(hook) = &self.on_disconnect {
            hook(reason);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_offline", &self.on_offline.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

/// Everything [`CloudClient::connect`](crate::CloudClient::connect) needs.
///
/// Which credentials are present decides how the client authenticates: a
/// bearer token wins over device credentials, which win over client
/// credentials.
///
/// ```
/// use iotcloud::CloudOptions;
///
/// let options = CloudOptions::new()
///     .with_client_credentials("my-client", "my-secret")
///     .with_cloud_protocol_v2(false);
/// assert_eq!(options.host, "iot.arduino.cc");
/// assert!(!format!("{:?}", options).contains("my-secret"));
/// ```
#[derive(Clone)]
pub struct CloudOptions {
    pub host: String,
    /// Overrides the strategy's default port.
    pub port: Option<u16>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub device_id: Option<String>,
    pub secret_key: Option<String>,
    /// Token exchange endpoint for client credentials.
    pub api_url: String,
    pub audience: String,
    /// Write property batches with integer labels.
    pub use_cloud_protocol_v2: bool,
    pub hooks: Hooks,
}

impl CloudOptions {
    pub fn new() -> Self {
        CloudOptions {
            host: DEFAULT_HOST.to_string(),
            port: None,
            token: None,
            client_id: None,
            client_secret: None,
            device_id: None,
            secret_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            use_cloud_protocol_v2: true,
            hooks: Hooks::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_client_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = Some(client_id.into());
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn with_device_credentials(
        mut self,
        device_id: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.device_id = Some(device_id.into());
        self.secret_key = Some(secret_key.into());
        self
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    pub fn with_cloud_protocol_v2(mut self, enabled: bool) -> Self {
        self.use_cloud_protocol_v2 = enabled;
        self
    }

    pub fn on_connected(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_connected = Some(Arc::new(hook));
        self
    }

    pub fn on_offline(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.on_offline = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect(mut self, hook: impl Fn(Option<&str>) + Send + Sync + 'static) -> Self {
        self.hooks.on_disconnect = Some(Arc::new(hook));
        self
    }
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self::new()
    }
}

fn redact(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "<redacted>")
}

impl fmt::Debug for CloudOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("token", &redact(&self.token))
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("device_id", &self.device_id)
            .field("secret_key", &redact(&self.secret_key))
            .field("api_url", &self.api_url)
            .field("audience", &self.audience)
            .field("use_cloud_protocol_v2", &self.use_cloud_protocol_v2)
            .field("hooks", &self.hooks)
            .finish()
    }
}
