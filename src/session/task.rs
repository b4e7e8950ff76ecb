use std::time::Duration;

use futures::{Sink, SinkExt, TryStreamExt};
use mqttbytes::v4::{Packet, Publish, SubscribeReasonCode, Subscribe, Unsubscribe};
use mqttbytes::QoS;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::session::packet_id::{AckKind, WaitAckSlots, WaitingAck};
use crate::session::{Error, RequestError, SessionConfig, SessionEvent};

use super::keep_alive::*;

enum Inbound {
    Packet(Packet),
    KeepAlive(KeepAlive),
}

/// The framed connection plus the keep-alive bookkeeping that follows it.
struct MqttStream<T> {
    stream: crate::codec::Framed<T>,
    keep_alive: KeepAliveTimer,
}

impl<T: Unpin + AsyncRead + AsyncWrite> MqttStream<T> {
    pub fn new(stream: T, keep_alive: Duration) -> Self {
        Self {
            stream: crate::codec::Framed::new(stream),
            keep_alive: KeepAliveTimer::new(keep_alive),
        }
    }

    pub async fn next(&mut self) -> Result<Inbound, Error> {
        tokio::select! {
            packet = self.stream.try_next() => {
                let packet = packet?.ok_or(Error::ConnectionClosed)?;
                self.keep_alive.received();
                Ok(Inbound::Packet(packet))
            }
            keep_alive = self.keep_alive.wait() => Ok(Inbound::KeepAlive(keep_alive)),
        }
    }

    pub async fn send<Item>(
        &mut self,
        item: Item,
    ) -> Result<(), <crate::codec::Framed<T> as Sink<Item>>::Error>
    where
        crate::codec::Framed<T>: Sink<Item>,
    {
        self.stream.send(item).await?;
        self.keep_alive.sent();
        Ok(())
    }
}

enum State {
    SendConnect,
    WaitingConnAck,
    Connected,
    NeedReset,
}

enum Flow {
    Continue,
    Stop,
}

#[derive(Debug)]
pub struct CommandResultRx<T, E>(pub tokio::sync::oneshot::Receiver<Result<T, E>>);

#[derive(Debug)]
pub struct CommandResultTx<T, E>(pub tokio::sync::oneshot::Sender<Result<T, E>>);

#[derive(Debug)]
pub(crate) enum TaskCommand {
    Publish(Publish, CommandResultTx<(), RequestError>),
    Subscribe(Subscribe, CommandResultTx<(), RequestError>),
    Unsubscribe(Unsubscribe, CommandResultTx<(), RequestError>),
    Disconnect(CommandResultTx<(), RequestError>),
}

/// The event loop behind a [`Session`](crate::session::Session).
///
/// It owns the byte stream and must be polled through [`SessionTask::run`],
/// usually from a spawned tokio task.
pub struct SessionTask<T> {
    stream: MqttStream<T>,
    state: State,
    config: SessionConfig,
    commands: mpsc::Receiver<TaskCommand>,
    events: mpsc::Sender<SessionEvent>,
    ack_slots: WaitAckSlots,
}

impl<T: Unpin + AsyncRead + AsyncWrite> SessionTask<T> {
    pub(crate) fn new(
        stream: T,
        config: SessionConfig,
    ) -> (
        Self,
        mpsc::Sender<TaskCommand>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (event_tx, event_rx) = mpsc::channel(100);
        (
            Self {
                stream: MqttStream::new(stream, config.keep_alive()),
                state: State::SendConnect,
                config,
                commands: command_rx,
                events: event_tx,
                ack_slots: WaitAckSlots::new(32),
            },
            command_tx,
            event_rx,
        )
    }

    pub async fn run(&mut self) -> Result<(), Error> {
        let res = self.run_inner().await;
        self.state = State::NeedReset;
        self.ack_slots.fail_all(RequestError::SessionClosed);
        res
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        loop {
            match self.state {
                State::SendConnect => {
                    log::debug!("Sending CONNECT for {}", self.config.client_id());
                    self.stream.send(self.config.as_connect()).await?;
                    self.stream.keep_alive.expect_response();
                    self.state = State::WaitingConnAck;
                }
                State::WaitingConnAck => {
                    self.wait_connack().await?;
                    let _ = self.events.send(SessionEvent::Connected).await;
                    self.state = State::Connected;
                }
                State::Connected => {
                    return self.handle_connected_state().await;
                }
                State::NeedReset => {
                    log::debug!("Attempting to run a session without resetting it first");
                    return Err(Error::NeedReset);
                }
            }
        }
    }

    async fn wait_connack(&mut self) -> Result<(), Error> {
        loop {
            match self.stream.next().await? {
                Inbound::Packet(Packet::ConnAck(x)) => {
                    log::debug!("CONNACK received: {:?}", x.code);
                    return if x.code == mqttbytes::v4::ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(Error::ConnectionRejected(x.code))
                    };
                }
                Inbound::Packet(x) => return Err(Error::NotConnack(x)),
                Inbound::KeepAlive(KeepAlive::PingResponseDeadline) => {
                    return Err(Error::KeepAliveTimeout);
                }
                Inbound::KeepAlive(KeepAlive::PingRequest) => {}
            }
        }
    }

    async fn handle_connected_state(&mut self) -> Result<(), Error> {
        loop {
            tokio::select! {
                inbound = self.stream.next() => match inbound? {
                    Inbound::Packet(packet) => self.handle_connected_server_packet(packet).await?,
                    Inbound::KeepAlive(keep_alive) => self.handle_connected_keep_alive(keep_alive).await?,
                },
                command = self.commands.recv() => {
                    let command = command.ok_or(Error::UserStop)?;
                    if let Flow::Stop = self.handle_connected_session_event(command).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connected_server_packet(&mut self, packet: Packet) -> Result<(), Error> {
        use mqttbytes::v4::*;
        match packet {
            Packet::Publish(publish) => {
                log::debug!(
                    "Received {} bytes on {} (QoS {:?})",
                    publish.payload.len(),
                    publish.topic,
                    publish.qos
                );
                if publish.qos == QoS::AtLeastOnce {
                    log::debug!("Sending PUBACK for {}", publish.pkid);
                    self.stream.send(&PubAck::new(publish.pkid)).await?;
                } else if publish.qos == QoS::ExactlyOnce {
                    log::debug!("Sending PUBREC for {}", publish.pkid);
                    self.stream.send(&PubRec::new(publish.pkid)).await?;
                }
                let event = SessionEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if self.events.send(event).await.is_err() {
                    log::debug!("Dropping inbound publish, nobody is listening");
                }
            }
            Packet::PubAck(ack) => match self.ack_slots.take(AckKind::PubAck, ack.pkid) {
                Some(x) => {
                    log::debug!("PUBACK for {} received", ack.pkid);
                    x.resolve(Ok(()));
                }
                None => log::warn!("Received PUBACK for unknown packet id {}", ack.pkid),
            },
            Packet::SubAck(ack) => match self.ack_slots.take(AckKind::SubAck, ack.pkid) {
                Some(x) => {
                    log::debug!("SUBACK for {} received: {:?}", ack.pkid, ack.return_codes);
                    let rejected = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    x.resolve(if rejected {
                        Err(RequestError::Rejected)
                    } else {
                        Ok(())
                    });
                }
                None => log::warn!("Received SUBACK for unknown packet id {}", ack.pkid),
            },
            Packet::UnsubAck(ack) => match self.ack_slots.take(AckKind::UnsubAck, ack.pkid) {
                Some(x) => {
                    log::debug!("UNSUBACK for {} received", ack.pkid);
                    x.resolve(Ok(()));
                }
                None => log::warn!("Received UNSUBACK for unknown packet id {}", ack.pkid),
            },
            Packet::PubRel(pubrel) => {
                log::debug!("PUBREL received: {:?}", pubrel);
                self.stream.send(&PubComp::new(pubrel.pkid)).await?;
            }
            Packet::Disconnect => {
                log::debug!("DISCONNECT received");
                return Err(Error::BrokerDisconnect);
            }
            x => {
                log::debug!("Received {:?}", x);
            }
        }

        Ok(())
    }

    async fn handle_connected_keep_alive(&mut self, keep_alive: KeepAlive) -> Result<(), Error> {
        match keep_alive {
            KeepAlive::PingRequest => {
                log::debug!("Writing ping request");
                self.stream.send(&mqttbytes::v4::PingReq).await?;
                self.stream.keep_alive.expect_response();
                Ok(())
            }
            KeepAlive::PingResponseDeadline => {
                log::debug!("Ping response deadline reached");
                Err(Error::KeepAliveTimeout)
            }
        }
    }

    async fn handle_connected_session_event(&mut self, event: TaskCommand) -> Result<Flow, Error> {
        match event {
            TaskCommand::Publish(publish, response) => self.publish(publish, response).await?,
            TaskCommand::Subscribe(mut subscribe, response) => {
                let ack = WaitingAck::new(AckKind::SubAck, response);
                if let Some(packet_id) = self.park(ack) {
                    subscribe.pkid = packet_id;
                    log::debug!("Sending SUBSCRIBE {} for {:?}", packet_id, subscribe.filters);
                    let res = self.stream.send(subscribe).await;
                    self.release_on_error(AckKind::SubAck, packet_id, &res);
                    res?;
                }
            }
            TaskCommand::Unsubscribe(mut unsubscribe, response) => {
                let ack = WaitingAck::new(AckKind::UnsubAck, response);
                if let Some(packet_id) = self.park(ack) {
                    unsubscribe.pkid = packet_id;
                    log::debug!("Sending UNSUBSCRIBE {} for {:?}", packet_id, unsubscribe.topics);
                    let res = self.stream.send(unsubscribe).await;
                    self.release_on_error(AckKind::UnsubAck, packet_id, &res);
                    res?;
                }
            }
            TaskCommand::Disconnect(response) => {
                log::debug!(
                    "Sending DISCONNECT with {} requests still waiting",
                    self.ack_slots.len()
                );
                let res = self.stream.send(&mqttbytes::v4::Disconnect).await;
                let _ = response.0.send(match &res {
                    Ok(_) => Ok(()),
                    Err(e) => Err(RequestError::from(e)),
                });
                res?;
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn park(&mut self, ack: WaitingAck) -> Option<u16> {
        match self.ack_slots.try_insert(ack) {
            Ok(packet_id) => Some(packet_id),
            Err(ack) => {
                ack.resolve(Err(RequestError::NoPacketIdAvailable));
                None
            }
        }
    }

    fn release_on_error<E>(&mut self, kind: AckKind, packet_id: u16, res: &Result<(), E>)
    where
        for<'a> RequestError: From<&'a E>,
        E: std::fmt::Debug,
    {
        if let Err(e) = res {
            log::warn!("Failed to send packet {}: {:?}", packet_id, e);
            if let Some(waiter) = self.ack_slots.take(kind, packet_id) {
                waiter.resolve(Err(RequestError::from(e)));
            }
        }
    }

    async fn publish(
        &mut self,
        mut publish: Publish,
        response: CommandResultTx<(), RequestError>,
    ) -> Result<(), Error> {
        log::debug!(
            "Publishing {} bytes to {}",
            publish.payload.len(),
            publish.topic
        );

        if publish.qos == QoS::AtMostOnce {
            self.publish_qos0(publish, response).await
        } else if publish.qos == QoS::AtLeastOnce {
            if let Some(packet_id) = self.park(WaitingAck::new(AckKind::PubAck, response)) {
                publish.pkid = packet_id;
                self.publish_qos1(publish).await?;
            }
            Ok(())
        } else {
            log::warn!("Unsupported QoS");
            let _ = response.0.send(Err(RequestError::Unspecified(
                "Unsupported QoS".to_string(),
            )));
            Ok(())
        }
    }

    async fn publish_qos0(
        &mut self,
        publish: Publish,
        response: CommandResultTx<(), RequestError>,
    ) -> Result<(), Error> {
        log::debug!("Sending QoS0 publish");
        let res = self.stream.send(publish).await;
        let to_respond = match &res {
            Ok(_) => Ok(()),
            Err(e) => Err(RequestError::from(e)),
        };

        let _ = response.0.send(to_respond);

        res?;
        Ok(())
    }

    /// Publish a QoS1 message
    ///
    /// This function assumes that a correct packet ID has been set in the publish message and that
    /// a waiting ACK slot has been filled with a correct waiter.
    async fn publish_qos1(&mut self, publish: Publish) -> Result<(), Error> {
        let packet_id = publish.pkid;
        let res = self.stream.send(publish).await;
        if res.is_ok() {
            log::debug!("Sent PUBLISH with packet id {}", packet_id);
        }
        self.release_on_error(AckKind::PubAck, packet_id, &res);
        // Any error from the "send" above should be returned upwards
        res?;
        Ok(())
    }
}
