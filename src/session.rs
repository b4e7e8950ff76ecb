//! An async MQTT 3.1.1 session with a broker.
//!
//! A session is started by establishing a TCP/TLS/WebSocket/other connection with a broker.
//! Any stream that implements [`AsyncRead`] and [`AsyncWrite`] can be used ([`AsyncRead`] must be
//! cancellation safe!). The stream is then used to create a [`Session`] handle and a
//! [`SessionTask`] that performs the MQTT handshake and talks to the broker.
//!
//! [`AsyncRead`]: https://docs.rs/tokio/latest/tokio/io/trait.AsyncRead.html
//! [`AsyncWrite`]: https://docs.rs/tokio/latest/tokio/io/trait.AsyncWrite.html
//!
//! ## Session states
//!
//! ### Initial setup
//!
//! Each session will perform the following actions before it is considered established:
//!
//!   1. Send [`CONNECT`](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028)
//!   2. Wait for [`CONNACK`](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718033)
//!
//! **No ping requests are sent while waiting for `CONNACK`.
//!
//! Once `CONNACK` has been accepted [`SessionEvent::Connected`] is emitted and the
//! session serves publish, subscribe and unsubscribe requests from its [`Session`] handles.
//!
//! ### Operation of established sessions
//!
//! An established session will automatically send [`PINGREQ`](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718081)
//! if a non-zero keep alive has been set.
//!
//! Every publish from the broker is acknowledged according to its QoS and forwarded as
//! [`SessionEvent::Message`].
//!
//! #### QoS 2 handling
//!
//! The session will automatically respond to QoS 2 messages with [`PUBREC`](http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718048)
//! but it will otherwise treat the message as if it was sent with QoS 1.
//!
//! **QoS 2** in outgoing publishes is not supported and results in an error rather than anything being written.
//!
//! ## Examples
//!
//! ```no_run
//! # tokio_test::block_on( async move {
//! use std::time::Duration;
//! use iotcloud::session::{Publish, QoS, Session, SessionConfig};
//! use tokio::net::TcpStream;
//!
//! let mut config = SessionConfig::new("iotcloud-client");
//! config.set_keep_alive(Duration::from_secs(30));
//!
//! let stream = TcpStream::connect("test.mosquitto.org:1883").await.unwrap();
//! let (session, mut task, _events) = Session::new(stream, config);
//! tokio::spawn(async move { task.run().await });
//!
//! let publish = Publish::new("/iotcloud", QoS::AtLeastOnce, "hello");
//! println!("Publish result: {:?}", session.publish(publish).await);
//! # });
//! ```

use std::time::Duration;

use bytes::Bytes;
use mqttbytes::v4::Packet;
pub use mqttbytes::v4::{Login, Publish};
pub use mqttbytes::QoS;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec::CodecError;

mod keep_alive;
mod packet_id;
mod task;

pub use task::SessionTask;
use task::{CommandResultRx, CommandResultTx, TaskCommand};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("MQTT protocol error: {0}")]
    ProtocolError(mqttbytes::Error),
    #[error("MQTT Connect rejected: {0:?}")]
    ConnectionRejected(mqttbytes::v4::ConnectReturnCode),
    #[error("CONNACK expected, got {0:?}")]
    NotConnack(Packet),
    #[error("Keep alive timeout")]
    KeepAliveTimeout,
    #[error("The session must be reset before it can be used again")]
    NeedReset,
    #[error("Connection closed for unknown reason")]
    ConnectionClosed,
    #[error("Broker sent DISCONNECT")]
    BrokerDisconnect,
    #[error("All session handles were dropped")]
    UserStop,
}

impl From<CodecError> for Error {
    fn from(v: CodecError) -> Self {
        match v {
            CodecError::IoError(io) => io.into(),
            CodecError::ProtocolError(e) => Self::ProtocolError(e),
        }
    }
}

/// Failure of a single request made through a [`Session`] handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error("No packet identifier available")]
    NoPacketIdAvailable,
    #[error("Broker rejected the subscription")]
    Rejected,
    #[error("Session is closed")]
    SessionClosed,
    #[error("{0}")]
    Unspecified(String),
}

impl From<&CodecError> for RequestError {
    fn from(e: &CodecError) -> Self {
        Self::Unspecified(e.to_string())
    }
}

/// Notifications emitted by a running [`SessionTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `CONNACK` accepted, the session is established.
    Connected,
    /// A publish received from the broker.
    Message { topic: String, payload: Bytes },
}

/// Configuration values for setting up a session
#[derive(Clone, PartialEq, Debug)]
pub struct SessionConfig {
    client_id: String,
    login: Option<Login>,
    keep_alive: Duration,
    clean_session: bool,
}

impl SessionConfig {
    /// Create a new [`SessionConfig`].
    ///
    /// The following default values are used:
    ///
    /// * `login`: `None`
    /// * `keep_alive`: 5 minutes
    /// * `clean_session`: `false`
    ///
    /// `client_id` is not verified in any way to be conforming to the MQTT specification.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use iotcloud::session::SessionConfig;
    /// let config = SessionConfig::new("iotcloud-client");
    /// assert_eq!(config.client_id(), "iotcloud-client");
    /// assert_eq!(config.keep_alive(), Duration::from_secs(5 * 60));
    /// ```
    pub fn new<S: ToString>(client_id: S) -> Self {
        SessionConfig {
            client_id: client_id.to_string(),
            login: None,
            keep_alive: Duration::from_secs(5 * 60),
            clean_session: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_login(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.login = Some(Login {
            username: username.into(),
            password: password.into(),
        });
    }

    /// Set the keep alive interval, clamped to what fits in `CONNECT` (`u16::MAX` seconds).
    pub fn set_keep_alive(&mut self, keep_alive: Duration) {
        self.keep_alive = keep_alive.min(Duration::from_secs(u16::MAX.into()));
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn set_clean_session(&mut self, clean_session: bool) {
        self.clean_session = clean_session;
    }

    pub(crate) fn as_connect(&self) -> mqttbytes::v4::Connect {
        let mut connect = mqttbytes::v4::Connect::new(self.client_id.clone());
        connect.clean_session = self.clean_session;
        connect.keep_alive = self.keep_alive.as_secs() as u16;
        connect.login = self.login.clone();
        connect
    }
}

/// Cloneable handle used to issue requests to a running [`SessionTask`].
///
/// The task stops with [`Error::UserStop`] once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct Session {
    commands: mpsc::Sender<TaskCommand>,
}

impl Session {
    pub fn new<T: Unpin + AsyncRead + AsyncWrite>(
        stream: T,
        config: SessionConfig,
    ) -> (Self, SessionTask<T>, mpsc::Receiver<SessionEvent>) {
        let (task, commands, events) = SessionTask::new(stream, config);
        (Self { commands }, task, events)
    }

    /// Publish a message, resolving once it is written (QoS 0) or acknowledged (QoS 1).
    pub async fn publish(&self, publish: Publish) -> Result<(), RequestError> {
        self.request(|tx| TaskCommand::Publish(publish, tx)).await
    }

    /// Subscribe to a single topic filter, resolving on `SUBACK`.
    pub async fn subscribe(&self, topic: impl Into<String>, qos: QoS) -> Result<(), RequestError> {
        let subscribe = mqttbytes::v4::Subscribe::new(topic.into(), qos);
        self.request(|tx| TaskCommand::Subscribe(subscribe, tx)).await
    }

    /// Unsubscribe from a topic filter, resolving on `UNSUBACK`.
    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<(), RequestError> {
        let unsubscribe = mqttbytes::v4::Unsubscribe::new(topic.into());
        self.request(|tx| TaskCommand::Unsubscribe(unsubscribe, tx))
            .await
    }

    /// Send `DISCONNECT` and stop the session task.
    pub async fn disconnect(&self) -> Result<(), RequestError> {
        self.request(TaskCommand::Disconnect).await
    }

    async fn request(
        &self,
        make: impl FnOnce(CommandResultTx<(), RequestError>) -> TaskCommand,
    ) -> Result<(), RequestError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(make(CommandResultTx(tx)))
            .await
            .map_err(|_| RequestError::SessionClosed)?;
        CommandResultRx(rx).wait().await
    }
}

impl<T> CommandResultRx<T, RequestError> {
    async fn wait(self) -> Result<T, RequestError> {
        self.0.await.map_err(|_| RequestError::SessionClosed)?
    }
}
