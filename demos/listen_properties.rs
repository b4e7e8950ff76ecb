//! Print every value of one property and echo it back under another name.
//!
//! Talks to a plain MQTT broker by pinning every endpoint to `IOT_BROKER`
//! (default `127.0.0.1:1883`). Credentials come from `IOT_TOKEN`, or from
//! `IOT_DEVICE_ID` and `IOT_SECRET_KEY`.
//!
//! ```text
//! IOT_TOKEN=... IOT_THING=my-thing cargo run --example listen_properties
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use iotcloud::connector::BoxStream;
use iotcloud::token::HttpTokenExchange;
use iotcloud::{CloudClient, CloudOptions, Connector, Endpoint, PropertyValue, TcpConnector, Timestamp};
use tokio::sync::mpsc;

/// Ignores the endpoint the strategy picked and dials a fixed broker instead.
struct PinnedConnector(Endpoint);

impl Connector for PinnedConnector {
    fn connect<'a>(&'a self, _endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<BoxStream>> {
        Box::pin(async move { TcpConnector.connect(&self.0).await })
    }
}

fn broker() -> Endpoint {
    let address = std::env::var("IOT_BROKER").unwrap_or_else(|_| "127.0.0.1:1883".to_string());
    match address.rsplit_once(':') {
        Some((host, port)) => Endpoint::new(host, port.parse().unwrap_or(1883)),
        None => Endpoint::new(address, 1883),
    }
}

#[tokio::main]
async fn main() -> iotcloud::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init()
        .unwrap();

    let mut options = CloudOptions::new()
        .on_connected(|| println!("connected"))
        .on_offline(|| println!("offline"))
        .on_disconnect(|reason| println!("disconnected: {:?}", reason));
    if let Ok(token) = std::env::var("IOT_TOKEN") {
        options = options.with_token(token);
    }
    if let (Ok(device), Ok(secret)) = (std::env::var("IOT_DEVICE_ID"), std::env::var("IOT_SECRET_KEY")) {
        options = options.with_device_credentials(device, secret);
    }

    let client = CloudClient::with_transport(
        Arc::new(PinnedConnector(broker())),
        Arc::new(HttpTokenExchange::new()),
    );
    client.connect(options).await?;

    let thing = match client.thing_id().await {
        Some(thing) => thing,
        None => std::env::var("IOT_THING").unwrap_or_else(|_| "demo-thing".to_string()),
    };
    println!("listening on thing {}", thing);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .on_property_value(&thing, "temperature", move |value: PropertyValue| {
            let _ = tx.send(value);
        })
        .await?;

    loop {
        tokio::select! {
            value = rx.recv() => {
                let Some(value) = value else { break };
                println!("temperature = {:?}", value);
                client.send_property(&thing, "temperature_echo", value, Timestamp::Now).await?;
            }
            _ = tokio::time::sleep(Duration::from_secs(60)) => {
                println!("no update for a minute");
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect().await
}
