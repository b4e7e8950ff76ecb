//! In-process broker and collaborators shared by the connection and client tests.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::prelude::*;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, Publish, SubAck, SubscribeReasonCode,
    UnsubAck,
};
use mqttbytes::QoS;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::codec::Framed;
use crate::connector::{BoxStream, Connector, Endpoint};
use crate::error::Result;
use crate::token::{AccessToken, TokenExchange, TokenRequest};

/// A JWT whose payload carries `user_id` in the user id claim.
pub(crate) fn fake_token(user_id: &str) -> String {
    let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = BASE64_URL_SAFE_NO_PAD
        .encode(format!(r#"{{"http://arduino.cc/id":"{}"}}"#, user_id).as_bytes());
    format!("{}.{}.sig", header, payload)
}

/// Hands every opened stream to the paired [`MockBroker`].
pub(crate) struct MockConnector {
    links: mpsc::UnboundedSender<BrokerLink>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, MockBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            links: tx,
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        (connector, MockBroker { links: rx })
    }

    /// Refuse the next `n` connection attempts.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxStream>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refuse = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }

            let (client, server) = tokio::io::duplex(16 * 1024);
            self.links
                .send(BrokerLink {
                    endpoint: endpoint.clone(),
                    stream: Framed::new(server),
                })
                .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "broker gone"))?;
            Ok(Box::new(client) as BoxStream)
        })
    }
}

pub(crate) struct MockBroker {
    links: mpsc::UnboundedReceiver<BrokerLink>,
}

impl MockBroker {
    pub(crate) async fn next_link(&mut self) -> BrokerLink {
        self.links.recv().await.unwrap()
    }

    /// Wait for the next connection and accept its CONNECT.
    pub(crate) async fn accept(&mut self) -> BrokerLink {
        let mut link = self.next_link().await;
        link.accept_connect().await;
        link
    }
}

/// The broker side of one client connection.
pub(crate) struct BrokerLink {
    pub(crate) endpoint: Endpoint,
    stream: Framed<DuplexStream>,
}

impl BrokerLink {
    /// Next packet from the client, answering pings on the way. `None` once the client is gone.
    pub(crate) async fn next_packet(&mut self) -> Option<Packet> {
        loop {
            match self.stream.next().await {
                Some(Ok(Packet::PingReq)) => {
                    self.stream.send(Packet::PingResp).await.ok()?;
                }
                Some(Ok(packet)) => return Some(packet),
                _ => return None,
            }
        }
    }

    pub(crate) async fn expect_connect(&mut self) -> Connect {
        match self.next_packet().await {
            Some(Packet::Connect(connect)) => connect,
            x => panic!("Expected CONNECT, got {:?}", x),
        }
    }

    pub(crate) async fn accept_connect(&mut self) -> Connect {
        let connect = self.expect_connect().await;
        self.connack(ConnectReturnCode::Success).await;
        connect
    }

    pub(crate) async fn connack(&mut self, code: ConnectReturnCode) {
        self.stream
            .send(ConnAck {
                session_present: false,
                code,
            })
            .await
            .unwrap();
    }

    /// Read a SUBSCRIBE, grant it and return its topic.
    pub(crate) async fn expect_subscribe(&mut self) -> String {
        self.answer_subscribe(SubscribeReasonCode::Success(QoS::AtMostOnce))
            .await
    }

    /// Read a SUBSCRIBE, refuse it and return its topic.
    pub(crate) async fn reject_subscribe(&mut self) -> String {
        self.answer_subscribe(SubscribeReasonCode::Failure).await
    }

    async fn answer_subscribe(&mut self, code: SubscribeReasonCode) -> String {
        match self.next_packet().await {
            Some(Packet::Subscribe(subscribe)) => {
                let ack = SubAck::new(subscribe.pkid, vec![code]);
                self.stream.send(ack).await.unwrap();
                subscribe.filters[0].path.clone()
            }
            x => panic!("Expected SUBSCRIBE, got {:?}", x),
        }
    }

    pub(crate) async fn expect_unsubscribe(&mut self) -> String {
        match self.next_packet().await {
            Some(Packet::Unsubscribe(unsubscribe)) => {
                self.stream
                    .send(UnsubAck::new(unsubscribe.pkid))
                    .await
                    .unwrap();
                unsubscribe.topics[0].clone()
            }
            x => panic!("Expected UNSUBSCRIBE, got {:?}", x),
        }
    }

    /// Read a PUBLISH, acknowledging it when QoS 1.
    pub(crate) async fn expect_publish(&mut self) -> Publish {
        match self.next_packet().await {
            Some(Packet::Publish(publish)) => {
                if publish.qos == QoS::AtLeastOnce {
                    self.stream.send(PubAck::new(publish.pkid)).await.unwrap();
                }
                publish
            }
            x => panic!("Expected PUBLISH, got {:?}", x),
        }
    }

    /// Deliver a QoS 0 message to the client.
    pub(crate) async fn publish(&mut self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.stream
            .send(Publish::new(topic, QoS::AtMostOnce, payload.into()))
            .await
            .unwrap();
    }

    pub(crate) async fn send_disconnect(&mut self) {
        self.stream.send(Packet::Disconnect).await.unwrap();
    }

    /// True once the client has closed its end, skipping anything still buffered.
    pub(crate) async fn closed(&mut self) -> bool {
        loop {
            match self.stream.next().await {
                None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Hands out a fixed token and records each request.
pub(crate) struct MockExchange {
    token: String,
    requests: Mutex<Vec<(String, TokenRequest)>>,
}

impl MockExchange {
    pub(crate) fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(MockExchange {
            token: token.into(),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<(String, TokenRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

impl TokenExchange for MockExchange {
    fn exchange<'a>(
        &'a self,
        api_url: &'a str,
        request: &'a TokenRequest,
    ) -> BoxFuture<'a, Result<AccessToken>> {
        Box::pin(async move {
            self.requests
                .lock()
                .unwrap()
                .push((api_url.to_string(), request.clone()));
            Ok(AccessToken {
                access_token: self.token.clone(),
                expires_in: Some(300),
                token_type: Some("Bearer".to_string()),
            })
        })
    }
}
