//! One authenticated MQTT link to the cloud and the decoded event stream it feeds.
//!
//! A [`Connection`] owns at most one live link. Each link runs two tasks:
//! the [`SessionTask`](crate::session::SessionTask) speaking MQTT, and a pump
//! that turns inbound publishes into [`PropertyEvent`]s and hands a copy to
//! every receiver obtained from [`Connection::messages`]. Receivers are
//! unbounded, so a slow consumer falls behind but never misses a frame.
//! Every (re)connect starts with no receivers; those taken from an earlier
//! link close when that link goes away.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connector::{BoxStream, Connector, Endpoint};
use crate::error::{Error, Result};
use crate::options::Hooks;
use crate::senml::{self, PropertyEvent, PropertyValue};
use crate::session::{self, Publish, QoS, Session, SessionConfig, SessionEvent};
use crate::token::user_id_from_token;
use crate::topic;

pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Delay between failed reconnect attempts while rotating a token.
pub const TOKEN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How the link authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Device {
        device_id: String,
        secret_key: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(<redacted>)"),
            Credentials::Device { device_id, .. } => f
                .debug_struct("Device")
                .field("device_id", device_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Receivers of one link's decoded events.
#[derive(Default)]
struct Subscribers(Mutex<Vec<mpsc::UnboundedSender<PropertyEvent>>>);

impl Subscribers {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PropertyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// Deliver to every receiver still alive, forgetting the dropped ones.
    fn send(&self, event: PropertyEvent) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

type TaskResult = std::result::Result<(), session::Error>;

/// Aborts the session task unless ownership is handed to a pump.
struct TaskGuard(Option<JoinHandle<TaskResult>>);

impl TaskGuard {
    fn into_inner(mut self) -> Option<JoinHandle<TaskResult>> {
        self.0.take()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(task) = &self.0 {
            task.abort();
        }
    }
}

struct Link {
    session: Session,
    task: tokio::task::AbortHandle,
    pump: JoinHandle<()>,
    ending: Arc<AtomicBool>,
    subscribers: Arc<Subscribers>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.ending.store(true, Ordering::SeqCst);
        self.pump.abort();
        self.task.abort();
    }
}

pub struct Connection {
    connector: Arc<dyn Connector>,
    endpoint: Endpoint,
    credentials: Credentials,
    hooks: Hooks,
    link: Option<Link>,
}

impl Connection {
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: Endpoint,
        credentials: Credentials,
        hooks: Hooks,
    ) -> Self {
        Connection {
            connector,
            endpoint,
            credentials,
            hooks,
            link: None,
        }
    }

    /// Open the link and wait for the broker to accept it.
    pub async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Err(Error::ConnectionAlreadyOpen);
        }
        self.link = Some(self.open().await?);
        Ok(())
    }

    /// Tear down the link. Without `force` a `DISCONNECT` is sent first.
    ///
    /// No lifecycle hooks fire for a link closed this way.
    pub async fn end(&mut self, force: bool) -> Result<()> {
        let link = self.link.take().ok_or(Error::NoConnection)?;
        link.ending.store(true, Ordering::SeqCst);
        if !force {
            match link.session.disconnect().await {
                Ok(()) | Err(session::RequestError::SessionClosed) => {}
                Err(e) => return Err(Error::transport("disconnect")(e)),
            }
        }
        log::debug!("Connection to {} ended", self.endpoint);
        Ok(())
    }

    /// Replace the live link with a fresh one using the current credentials.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.end(true).await?;
        self.link = Some(self.open().await?);
        Ok(())
    }

    /// Switch to `token`, closing the live link and reconnecting until it succeeds.
    ///
    /// Failed attempts are retried every [`TOKEN_RETRY_DELAY`] with no upper
    /// bound. Only `cancel` stops the loop, with [`Error::Cancelled`].
    pub async fn update_token(&mut self, token: String, cancel: &CancellationToken) -> Result<()> {
        if let Credentials::Device { .. } = self.credentials {
            return Err(Error::TokenRotationUnsupported);
        }
        user_id_from_token(&token)?;

        if self.link.is_some() {
            self.end(true).await?;
        }
        self.credentials = Credentials::Token(token);

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                attempt = self.open() => attempt,
            };
            match attempt {
                Ok(link) => {
                    self.link = Some(link);
                    return Ok(());
                }
                Err(e) => log::error!(
                    "Reconnect with new token failed, retrying in {:?}: {}",
                    TOKEN_RETRY_DELAY,
                    e
                ),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(TOKEN_RETRY_DELAY) => {}
            }
        }
    }

    /// Publish with QoS 1, resolving on `PUBACK`.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let publish = Publish::new(topic, QoS::AtLeastOnce, payload.into());
        self.session()?
            .publish(publish)
            .await
            .map_err(Error::transport("publish"))
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        log::debug!("Subscribing to {}", topic);
        self.session()?
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(Error::transport("subscribe"))
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        log::debug!("Unsubscribing from {}", topic);
        self.session()?
            .unsubscribe(topic)
            .await
            .map_err(Error::transport("unsubscribe"))
    }

    /// Events decoded from the current link.
    pub fn messages(&self) -> Result<mpsc::UnboundedReceiver<PropertyEvent>> {
        let link = self.link.as_ref().ok_or(Error::NoConnection)?;
        Ok(link.subscribers.subscribe())
    }

    /// True while a link exists and its transport is still up.
    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .map_or(false, |link| !link.pump.is_finished())
    }

    pub fn token(&self) -> Option<&str> {
        match &self.credentials {
            Credentials::Token(token) => Some(token),
            Credentials::Device { .. } => None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn session(&self) -> Result<&Session> {
        self.link
            .as_ref()
            .map(|link| &link.session)
            .ok_or(Error::NoConnection)
    }

    fn session_config(&self) -> Result<SessionConfig> {
        if self.endpoint.host.is_empty() {
            return Err(Error::InvalidOptions);
        }
        let (client_id, username, password) = match &self.credentials {
            Credentials::Token(token) => {
                if token.is_empty() {
                    return Err(Error::InvalidOptions);
                }
                let user_id = user_id_from_token(token)?;
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                (format!("{}:{}", user_id, millis), user_id, token.clone())
            }
            Credentials::Device {
                device_id,
                secret_key,
            } => {
                if device_id.is_empty() || secret_key.is_empty() {
                    return Err(Error::InvalidOptions);
                }
                (device_id.clone(), device_id.clone(), secret_key.clone())
            }
        };

        let mut config = SessionConfig::new(client_id);
        config.set_login(username, password);
        config.set_keep_alive(KEEP_ALIVE);
        config.set_clean_session(true);
        Ok(config)
    }

    async fn open(&self) -> Result<Link> {
        let config = self.session_config()?;
        log::debug!("Connecting to {} as {}", self.endpoint, config.client_id());

        let stream: BoxStream = self
            .connector
            .connect(&self.endpoint)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let (session, mut task, mut inbound) = Session::new(stream, config);
        let guard = TaskGuard(Some(tokio::spawn(async move { task.run().await })));

        match tokio::time::timeout(CONNECT_TIMEOUT, inbound.recv()).await {
            Ok(Some(SessionEvent::Connected)) => {}
            Ok(_) => {
                let reason = match guard.into_inner() {
                    Some(task) => match task.await {
                        Ok(Err(e)) => e.to_string(),
                        Ok(Ok(())) => "session ended during handshake".to_string(),
                        Err(e) => e.to_string(),
                    },
                    None => "session ended during handshake".to_string(),
                };
                return Err(Error::ConnectionFailed(reason));
            }
            Err(_) => {
                return Err(Error::ConnectionFailed(format!(
                    "no CONNACK within {:?}",
                    CONNECT_TIMEOUT
                )))
            }
        }

        let task = guard.into_inner().ok_or_else(|| {
            Error::ConnectionFailed("session task missing".to_string())
        })?;
        log::debug!("Connected to {}", self.endpoint);

        let ending = Arc::new(AtomicBool::new(false));
        let subscribers = Arc::new(Subscribers::default());
        let abort = task.abort_handle();
        let pump = tokio::spawn(pump(
            task,
            inbound,
            subscribers.clone(),
            ending.clone(),
            self.hooks.clone(),
        ));

        Ok(Link {
            session,
            task: abort,
            pump,
            ending,
            subscribers,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Decode one inbound publish.
///
/// Monitor output is passed through as text; anything else is read as a
/// property batch. Undecodable frames yield nothing.
pub(crate) fn decode_frame(topic: &str, payload: &[u8]) -> Vec<PropertyEvent> {
    if topic::is_monitor_output(topic) {
        return vec![PropertyEvent {
            topic: topic.to_string(),
            property_name: None,
            value: PropertyValue::String(String::from_utf8_lossy(payload).into_owned()),
        }];
    }
    match senml::decode(payload) {
        Ok(records) => senml::group_by_property(topic, &records),
        Err(e) => {
            log::warn!("Dropping undecodable frame on {}: {}", topic, e);
            Vec::new()
        }
    }
}

async fn pump(
    task: JoinHandle<TaskResult>,
    mut inbound: mpsc::Receiver<SessionEvent>,
    subscribers: Arc<Subscribers>,
    ending: Arc<AtomicBool>,
    hooks: Hooks,
) {
    while let Some(event) = inbound.recv().await {
        if let SessionEvent::Message { topic, payload } = event {
            for event in decode_frame(&topic, &payload) {
                subscribers.send(event);
            }
        }
    }

    let outcome = task.await;
    if ending.load(Ordering::SeqCst) {
        return;
    }
    match outcome {
        Ok(Err(session::Error::BrokerDisconnect)) => {
            log::warn!("Broker closed the connection");
            hooks.disconnected(Some(&session::Error::BrokerDisconnect.to_string()));
        }
        Ok(Err(e)) => {
            log::warn!("Connection lost: {}", e);
            hooks.offline();
            hooks.disconnected(Some(&e.to_string()));
        }
        Ok(Ok(())) => hooks.disconnected(None),
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            log::warn!("Session task failed: {}", e);
            hooks.offline();
            hooks.disconnected(Some(&e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use mqttbytes::v4::ConnectReturnCode;
    use mqttbytes::QoS;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::options::Hooks;
    use crate::senml::{PropertyValue, Timestamp};
    use crate::testing::{fake_token, MockBroker, MockConnector};

    #[derive(Default)]
    struct HookLog {
        offline: AtomicUsize,
        reasons: Mutex<Vec<Option<String>>>,
    }

    fn hooks(log: &Arc<HookLog>) -> Hooks {
        let offline = log.clone();
        let disconnect = log.clone();
        Hooks {
            on_connected: None,
            on_offline: Some(Arc::new(move || {
                offline.offline.fetch_add(1, Ordering::SeqCst);
            })),
            on_disconnect: Some(Arc::new(move |reason| {
                disconnect
                    .reasons
                    .lock()
                    .unwrap()
                    .push(reason.map(str::to_string));
            })),
        }
    }

    fn token_connection(log: &Arc<HookLog>) -> (Connection, Arc<MockConnector>, MockBroker) {
        let (connector, broker) = MockConnector::new();
        let connection = Connection::new(
            connector.clone(),
            Endpoint::new("wss.iot.example", 8443),
            Credentials::Token(fake_token("user-1")),
            hooks(log),
        );
        (connection, connector, broker)
    }

    async fn connected(log: &Arc<HookLog>) -> (Connection, crate::testing::BrokerLink) {
        let (mut connection, _connector, mut broker) = token_connection(log);
        let (res, link) = tokio::join!(connection.connect(), broker.accept());
        res.unwrap();
        (connection, link)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn token_connect_packet() {
        let log = Arc::new(HookLog::default());
        let (mut connection, _connector, mut broker) = token_connection(&log);

        let (res, (connect, link)) = tokio::join!(connection.connect(), async {
            let mut link = broker.next_link().await;
            let connect = link.accept_connect().await;
            (connect, link)
        });
        res.unwrap();

        assert_eq!(link.endpoint, Endpoint::new("wss.iot.example", 8443));
        assert!(connect.client_id.starts_with("user-1:"));
        assert_eq!(connect.keep_alive, 30);
        assert!(connect.clean_session);
        let login = connect.login.unwrap();
        assert_eq!(login.username, "user-1");
        assert_eq!(login.password, fake_token("user-1"));
        assert!(connection.is_connected());
        assert_eq!(connection.token(), Some(fake_token("user-1").as_str()));
    }

    #[tokio::test]
    async fn device_connect_packet() {
        let (connector, mut broker) = MockConnector::new();
        let mut connection = Connection::new(
            connector,
            Endpoint::new("mqtts-up.iot.example", 8884),
            Credentials::Device {
                device_id: "d1".to_string(),
                secret_key: "s1".to_string(),
            },
            Hooks::default(),
        );

        let (res, connect) = tokio::join!(connection.connect(), async {
            broker.next_link().await.accept_connect().await
        });
        res.unwrap();
        assert_eq!(connect.client_id, "d1");
        let login = connect.login.unwrap();
        assert_eq!(login.username, "d1");
        assert_eq!(login.password, "s1");
        assert_eq!(connection.token(), None);
    }

    #[tokio::test]
    async fn missing_fields_fail_before_dialing() {
        let (connector, _broker) = MockConnector::new();
        let cases = [
            (Endpoint::new("", 8443), Credentials::Token(fake_token("u"))),
            (Endpoint::new("host", 8443), Credentials::Token(String::new())),
            (
                Endpoint::new("host", 8884),
                Credentials::Device {
                    device_id: "d1".to_string(),
                    secret_key: String::new(),
                },
            ),
        ];
        for (endpoint, credentials) in cases {
            let mut connection =
                Connection::new(connector.clone(), endpoint, credentials, Hooks::default());
            assert!(matches!(
                connection.connect().await,
                Err(Error::InvalidOptions)
            ));
        }
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn rejected_handshake_is_connection_failed() {
        let log = Arc::new(HookLog::default());
        let (mut connection, _connector, mut broker) = token_connection(&log);

        let (res, _link) = tokio::join!(connection.connect(), async {
            let mut link = broker.next_link().await;
            link.expect_connect().await;
            link.connack(ConnectReturnCode::NotAuthorized).await;
            link
        });
        assert!(matches!(res, Err(Error::ConnectionFailed(_))));
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let log = Arc::new(HookLog::default());
        let (mut connection, _link) = connected(&log).await;
        assert!(matches!(
            connection.connect().await,
            Err(Error::ConnectionAlreadyOpen)
        ));
    }

    #[tokio::test]
    async fn operations_need_a_link() {
        let log = Arc::new(HookLog::default());
        let (mut connection, _connector, _broker) = token_connection(&log);

        assert!(matches!(connection.publish("/t", vec![1]).await, Err(Error::NoConnection)));
        assert!(matches!(connection.subscribe("/t").await, Err(Error::NoConnection)));
        assert!(matches!(connection.unsubscribe("/t").await, Err(Error::NoConnection)));
        assert!(matches!(connection.messages(), Err(Error::NoConnection)));
        assert!(matches!(connection.end(false).await, Err(Error::NoConnection)));
        assert!(matches!(connection.reconnect().await, Err(Error::NoConnection)));
    }

    #[tokio::test]
    async fn publish_uses_qos1() {
        let log = Arc::new(HookLog::default());
        let (connection, mut link) = connected(&log).await;

        let (res, publish) = tokio::join!(
            connection.publish("/a/t/t1/e/i", vec![1, 2, 3]),
            link.expect_publish()
        );
        res.unwrap();
        assert_eq!(publish.topic, "/a/t/t1/e/i");
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert!(!publish.retain);
        assert_eq!(publish.payload.as_ref(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn frames_are_demultiplexed() {
        let log = Arc::new(HookLog::default());
        let (connection, mut link) = connected(&log).await;
        let mut messages = connection.messages().unwrap();

        let batch =
            senml::encode_batch("temp", &22.into(), Timestamp::At(1000), true, None).unwrap();
        link.publish("/a/t/t1/e/o", batch).await;
        link.publish("/a/t/t1/e/o", vec![0xff, 0x00]).await;
        link.publish("/a/d/d1/s/o", "hello monitor").await;

        let event = messages.recv().await.unwrap();
        assert_eq!(event.topic, "/a/t/t1/e/o");
        assert_eq!(event.property_name.as_deref(), Some("temp"));
        assert_eq!(event.value, PropertyValue::Number(22.0));

        let event = messages.recv().await.unwrap();
        assert_eq!(event.topic, "/a/d/d1/s/o");
        assert_eq!(event.property_name, None);
        assert_eq!(event.value, PropertyValue::from("hello monitor"));
    }

    #[tokio::test]
    async fn receivers_that_fall_behind_miss_nothing() {
        let log = Arc::new(HookLog::default());
        let (connection, mut link) = connected(&log).await;
        let mut early = connection.messages().unwrap();

        for i in 0..600_i32 {
            let batch =
                senml::encode_batch("temp", &PropertyValue::from(i), Timestamp::Omit, true, None)
                    .unwrap();
            link.publish("/a/t/t1/e/o", batch).await;
        }
        for i in 0..600 {
            assert_eq!(early.recv().await.unwrap().value, PropertyValue::Number(i as f64));
        }

        let mut late = connection.messages().unwrap();
        link.publish("/a/t/t1/e/o", "not cbor").await;
        link.publish("/a/d/d1/s/o", "done").await;
        assert_eq!(early.recv().await.unwrap().value, PropertyValue::from("done"));
        assert_eq!(late.recv().await.unwrap().value, PropertyValue::from("done"));
    }

    #[tokio::test]
    async fn end_closes_quietly() {
        let log = Arc::new(HookLog::default());
        let (mut connection, mut link) = connected(&log).await;

        connection.end(false).await.unwrap();
        assert!(matches!(link.next_packet().await, Some(mqttbytes::v4::Packet::Disconnect)));
        assert!(link.closed().await);
        assert!(!connection.is_connected());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.offline.load(Ordering::SeqCst), 0);
        assert!(log.reasons.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broker_disconnect_fires_disconnect_hook() {
        let log = Arc::new(HookLog::default());
        let (connection, mut link) = connected(&log).await;

        link.send_disconnect().await;
        wait_for(|| !connection.is_connected()).await;
        assert_eq!(log.reasons.lock().unwrap().len(), 1);
        assert_eq!(log.offline.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn lost_transport_fires_offline_then_disconnect() {
        let log = Arc::new(HookLog::default());
        let (connection, link) = connected(&log).await;

        drop(link);
        wait_for(|| !connection.is_connected()).await;
        assert_eq!(log.offline.load(Ordering::SeqCst), 1);
        assert!(log.reasons.lock().unwrap()[0].is_some());
    }

    #[tokio::test]
    async fn reconnect_opens_a_new_link() {
        let log = Arc::new(HookLog::default());
        let (connector, mut broker) = MockConnector::new();
        let mut connection = Connection::new(
            connector.clone(),
            Endpoint::new("wss.iot.example", 8443),
            Credentials::Token(fake_token("user-1")),
            hooks(&log),
        );
        let (res, mut first) = tokio::join!(connection.connect(), broker.accept());
        res.unwrap();

        let (res, (connect, _second)) = tokio::join!(connection.reconnect(), async {
            let mut link = broker.next_link().await;
            let connect = link.accept_connect().await;
            (connect, link)
        });
        res.unwrap();

        assert!(first.closed().await);
        assert!(connect.client_id.starts_with("user-1:"));
        assert_eq!(connector.attempts(), 2);
        assert!(connection.is_connected());
        assert!(log.reasons.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn token_rotation_retries_every_five_seconds() {
        let log = Arc::new(HookLog::default());
        let (connector, mut broker) = MockConnector::new();
        let mut connection = Connection::new(
            connector.clone(),
            Endpoint::new("wss.iot.example", 8443),
            Credentials::Token(fake_token("user-1")),
            hooks(&log),
        );
        let (res, _first) = tokio::join!(connection.connect(), broker.accept());
        res.unwrap();

        connector.fail_next(2);
        let started = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        let (res, connect) = tokio::join!(
            connection.update_token(fake_token("user-2"), &cancel),
            async { broker.next_link().await.accept_connect().await }
        );
        res.unwrap();

        assert_eq!(connector.attempts(), 4);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(15));
        assert!(connect.client_id.starts_with("user-2:"));
        assert_eq!(connection.token(), Some(fake_token("user-2").as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn token_rotation_stops_when_cancelled() {
        let log = Arc::new(HookLog::default());
        let (mut connection, connector, _broker) = token_connection(&log);

        connector.fail_next(usize::MAX);
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                cancel.cancel();
            })
        };

        let res = connection.update_token(fake_token("user-2"), &cancel).await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(connector.attempts(), 3);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_up_front() {
        let log = Arc::new(HookLog::default());
        let (mut connection, mut link) = connected(&log).await;

        let res = connection
            .update_token("not-a-jwt".to_string(), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(Error::InvalidToken(_))));
        assert!(connection.is_connected());

        let (res, _publish) =
            tokio::join!(connection.publish("/t", vec![0]), link.expect_publish());
        res.unwrap();
    }

    #[tokio::test]
    async fn device_credentials_cannot_rotate() {
        let (connector, _broker) = MockConnector::new();
        let mut connection = Connection::new(
            connector,
            Endpoint::new("mqtts-up.iot.example", 8884),
            Credentials::Device {
                device_id: "d1".to_string(),
                secret_key: "s1".to_string(),
            },
            Hooks::default(),
        );
        let res = connection
            .update_token(fake_token("u"), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(Error::TokenRotationUnsupported)));
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let printed = format!(
            "{:?} {:?}",
            Credentials::Token("tok-123".to_string()),
            Credentials::Device {
                device_id: "d1".to_string(),
                secret_key: "key-456".to_string()
            }
        );
        assert!(printed.contains("d1"));
        assert!(!printed.contains("tok-123"));
        assert!(!printed.contains("key-456"));
    }
}
