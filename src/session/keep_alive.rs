use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::either::Either;

#[derive(Debug, PartialEq, Eq)]
pub enum KeepAlive {
    PingRequest,
    PingResponseDeadline,
}

struct Timers {
    period: Duration,
    ping: Interval,
    deadline: Option<Pin<Box<Sleep>>>,
}

/// Drives PINGREQ emission and detects a silent broker.
///
/// A ping is due one keep-alive period after the last packet the client
/// sent; inbound traffic does not count. Once a packet that needs an answer
/// is out (CONNECT, PINGREQ) the broker has 1.5 times the period to send
/// anything back.
pub struct KeepAliveTimer {
    timer: Either<Timers, ()>,
}

impl KeepAliveTimer {
    pub fn new(duration: Duration) -> Self {
        let timer = if duration.is_zero() {
            Either::Right(())
        } else {
            let mut ping = tokio::time::interval_at(Instant::now() + duration, duration);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Either::Left(Timers {
                period: duration,
                ping,
                deadline: None,
            })
        };
        Self { timer }
    }

    /// A packet went out to the broker.
    pub fn sent(&mut self) {
        if let Either::Left(timers) = &mut self.timer {
            timers.ping.reset();
        }
    }

    /// A packet arrived from the broker.
    pub fn received(&mut self) {
        if let Either::Left(timers) = &mut self.timer {
            timers.deadline = None;
        }
    }

    /// Start waiting for the broker to answer, unless already waiting.
    pub fn expect_response(&mut self) {
        if let Either::Left(timers) = &mut self.timer {
            if timers.deadline.is_none() {
                let within = timers.period + timers.period / 2;
                timers.deadline = Some(Box::pin(tokio::time::sleep(within)));
            }
        }
    }

    pub async fn wait(&mut self) -> KeepAlive {
        match &mut self.timer {
            Either::Left(timers) => Self::tick(timers).await,
            Either::Right(_) => futures::future::pending().await,
        }
    }

    async fn tick(timers: &mut Timers) -> KeepAlive {
        match timers.deadline.as_mut() {
            Some(deadline) => tokio::select! {
                _ = timers.ping.tick() => KeepAlive::PingRequest,
                _ = deadline.as_mut() => KeepAlive::PingResponseDeadline,
            },
            None => {
                timers.ping.tick().await;
                KeepAlive::PingRequest
            }
        }
    }
}
