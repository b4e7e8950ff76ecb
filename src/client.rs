//! The public session: connect, send and receive properties, rotate tokens.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::connector::{Connector, TcpConnector};
use crate::error::{Error, Result};
use crate::options::{CloudOptions, Hooks};
use crate::registry::{self, Callback, Registry};
use crate::senml::{self, PropertyValue, Timestamp};
use crate::strategy::{Role, Strategy};
use crate::token::{HttpTokenExchange, TokenExchange};
use crate::topic;

/// The live half of a client: only present between `connect` and `disconnect`.
struct Active {
    connection: Connection,
    role: Role,
    use_cloud_protocol_v2: bool,
    hooks: Hooks,
    dispatcher: Option<JoinHandle<()>>,
}

impl Active {
    fn stop_dispatch(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }

    /// Attach the registry to the current link: subscribe every known topic
    /// and start delivering its events.
    ///
    /// If any subscription is refused the link is dropped, so the session
    /// reports [`Error::NoConnection`] instead of staying up without delivery.
    async fn bind(&mut self, registry: &Arc<Registry>) -> Result<()> {
        self.stop_dispatch();
        let messages = self.connection.messages()?;
        for topic in registry.topics() {
            if let Err(e) = self.connection.subscribe(&topic).await {
                log::warn!("Restoring subscription to {} failed: {}", topic, e);
                let _ = self.connection.end(true).await;
                return Err(e);
            }
        }
        self.dispatcher = Some(registry::spawn_dispatcher(registry.clone(), messages));
        Ok(())
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.stop_dispatch();
    }
}

/// A session with the IoT cloud.
///
/// Callbacks registered through [`on_property_value`](Self::on_property_value)
/// or [`subscribe`](Self::subscribe) survive [`reconnect`](Self::reconnect)
/// and [`update_token`](Self::update_token); they are dropped by
/// [`disconnect`](Self::disconnect).
///
/// ```no_run
/// # tokio_test::block_on(async move {
/// use iotcloud::{CloudClient, CloudOptions, Timestamp};
///
/// // `new` dials plain TCP; the hosted cloud needs a TLS `Connector`
/// // passed to `with_transport`.
/// let client = CloudClient::new();
/// client
///     .connect(CloudOptions::new().with_client_credentials("id", "secret"))
///     .await
///     .unwrap();
/// client
///     .on_property_value("thing-id", "temperature", |value| println!("{:?}", value))
///     .await
///     .unwrap();
/// client
///     .send_property("thing-id", "setpoint", 21.5, Timestamp::Now)
///     .await
///     .unwrap();
/// # });
/// ```
pub struct CloudClient {
    connector: Arc<dyn Connector>,
    exchange: Arc<dyn TokenExchange>,
    state: tokio::sync::Mutex<Option<Active>>,
    registry: Arc<Registry>,
    rotation: Mutex<CancellationToken>,
}

impl CloudClient {
    /// A client dialing plain TCP and exchanging tokens over HTTPS.
    ///
    /// The cloud's MQTT endpoints require TLS, so this only reaches brokers
    /// without it. Use [`with_transport`](Self::with_transport) with a
    /// TLS-capable [`Connector`] for the real cloud.
    pub fn new() -> Self {
        Self::with_transport(Arc::new(TcpConnector), Arc::new(HttpTokenExchange::new()))
    }

    pub fn with_transport(connector: Arc<dyn Connector>, exchange: Arc<dyn TokenExchange>) -> Self {
        CloudClient {
            connector,
            exchange,
            state: tokio::sync::Mutex::new(None),
            registry: Arc::new(Registry::default()),
            rotation: Mutex::new(CancellationToken::new()),
        }
    }

    /// Authenticate with the first strategy `options` satisfies.
    pub async fn connect(&self, options: CloudOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(Error::ConnectionAlreadyOpen);
        }

        let strategy = Strategy::select(&options)?;
        log::debug!("Connecting with {:?}", strategy);
        let (connection, role) = strategy
            .establish(&options, self.connector.clone(), self.exchange.as_ref())
            .await?;

        let mut active = Active {
            connection,
            role,
            use_cloud_protocol_v2: options.use_cloud_protocol_v2,
            hooks: options.hooks,
            dispatcher: None,
        };
        active.bind(&self.registry).await?;
        active.hooks.connected();
        *state = Some(active);
        Ok(())
    }

    /// Close the connection and forget every registered callback.
    ///
    /// A token rotation that is running or waiting is cancelled first.
    pub async fn disconnect(&self) -> Result<()> {
        self.rotation_token(true).cancel();
        self.registry.clear();

        let mut state = self.state.lock().await;
        let mut active = state.take().ok_or(Error::NoConnection)?;
        active.stop_dispatch();
        match active.connection.end(false).await {
            // A cancelled rotation can leave the connection without a link.
            Ok(()) | Err(Error::NoConnection) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reconnect with a new bearer token and restore every subscription.
    ///
    /// Retries until it succeeds or [`disconnect`](Self::disconnect) is
    /// called. Concurrent calls run one after another.
    pub async fn update_token(&self, token: impl Into<String>) -> Result<()> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::invalid_argument("token must not be empty"));
        }
        let cancel = self.rotation_token(false);

        let mut state = self.state.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let active = state.as_mut().ok_or(Error::NoConnection)?;
        if let Role::Device { .. } = active.role {
            return Err(Error::TokenRotationUnsupported);
        }

        active.stop_dispatch();
        active.connection.update_token(token, &cancel).await?;
        active.bind(&self.registry).await?;
        active.hooks.connected();
        Ok(())
    }

    /// Drop the link and open a new one with the same credentials.
    pub async fn reconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let active = state.as_mut().ok_or(Error::NoConnection)?;
        active.stop_dispatch();
        active.connection.reconnect().await?;
        active.bind(&self.registry).await?;
        active.hooks.connected();
        Ok(())
    }

    /// Publish a property of `thing_id`.
    ///
    /// User sessions write to the thing's input; device sessions write their
    /// own thing's output (see [`thing_id`](Self::thing_id)).
    pub async fn send_property(
        &self,
        thing_id: &str,
        name: &str,
        value: impl Into<PropertyValue>,
        timestamp: Timestamp,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("property name must be a non-empty string"));
        }
        let state = self.state.lock().await;
        let active = state.as_ref().ok_or(Error::NoConnection)?;

        let payload = senml::encode_batch(
            name,
            &value.into(),
            timestamp,
            active.use_cloud_protocol_v2,
            active.role.device_id(),
        )?;
        let topic = active.role.send_topic(thing_id);
        log::debug!("Sending {} to {}", name, topic);
        active.connection.publish(&topic, payload).await
    }

    /// Call `callback` with every new value of property `name` on `thing_id`.
    pub async fn on_property_value(
        &self,
        thing_id: &str,
        name: &str,
        callback: impl Fn(PropertyValue) + Send + Sync + 'static,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::invalid_argument("property name must be a non-empty string"));
        }
        let state = self.state.lock().await;
        let active = state.as_ref().ok_or(Error::NoConnection)?;
        let topic = active.role.listen_topic(thing_id);
        self.listen(active, &topic, Some(name.to_string()), Arc::new(callback))
            .await
    }

    /// Call `callback` with every value arriving on `topic`.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(PropertyValue) + Send + Sync + 'static,
    ) -> Result<()> {
        let state = self.state.lock().await;
        let active = state.as_ref().ok_or(Error::NoConnection)?;
        self.listen(active, topic, None, Arc::new(callback)).await
    }

    /// Drop every callback on `topic` and unsubscribe from it.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let state = self.state.lock().await;
        let active = state.as_ref().ok_or(Error::NoConnection)?;
        self.registry.remove_topic(topic);
        active.connection.unsubscribe(topic).await
    }

    /// Publish raw bytes on `topic`.
    pub async fn send_message(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let state = self.state.lock().await;
        let active = state.as_ref().ok_or(Error::NoConnection)?;
        active.connection.publish(topic, payload).await
    }

    /// Receive the text a device writes to its monitor.
    pub async fn open_cloud_monitor(
        &self,
        device_id: &str,
        callback: impl Fn(String) + Send + Sync + 'static,
    ) -> Result<()> {
        self.subscribe(&topic::monitor_outbound(device_id), move |value| {
            if let PropertyValue::String(text) = value {
                callback(text)
            }
        })
        .await
    }

    /// Write text to a device's monitor.
    pub async fn write_cloud_monitor(&self, device_id: &str, message: impl Into<Vec<u8>>) -> Result<()> {
        self.send_message(&topic::monitor_inbound(device_id), message)
            .await
    }

    pub async fn close_cloud_monitor(&self, device_id: &str) -> Result<()> {
        self.unsubscribe(&topic::monitor_outbound(device_id)).await
    }

    /// The bearer token of a token session.
    pub async fn get_token(&self) -> Option<String> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .and_then(|active| active.connection.token().map(str::to_string))
    }

    /// The thing announced to a device session.
    pub async fn thing_id(&self) -> Option<String> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .and_then(|active| active.role.thing_id().map(str::to_string))
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map_or(false, |active| active.connection.is_connected())
    }

    async fn listen(
        &self,
        active: &Active,
        topic: &str,
        property: Option<String>,
        callback: Callback,
    ) -> Result<()> {
        if self.registry.register(topic, property, callback) {
            if let Err(e) = active.connection.subscribe(topic).await {
                self.registry.remove_topic(topic);
                return Err(e);
            }
        }
        Ok(())
    }

    /// The current rotation token, replaced by a fresh one when `renew` is set.
    fn rotation_token(&self, renew: bool) -> CancellationToken {
        let mut current = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        if renew {
            std::mem::replace(&mut *current, CancellationToken::new())
        } else {
            current.clone()
        }
    }
}

impl Default for CloudClient {
    fn default() -> Self {
        Self::new()
    }
}
