//! A client-side session layer for an MQTT based IoT cloud.
//!
//! Properties of a "thing" travel as SenML records encoded in CBOR (see
//! [`senml`]). A [`CloudClient`] authenticates with whichever credentials are
//! present in its [`CloudOptions`], keeps one MQTT link open and routes inbound
//! property updates to registered callbacks. Callbacks survive reconnects and
//! token rotation.
//!
//! The MQTT 3.1.1 engine underneath lives in [`session`] and can be used on
//! its own over any async byte stream.
//!
//! The cloud endpoints (`wss.{host}:8443`, `mqtts-up.{host}:8884`) only
//! accept TLS. [`CloudClient::new`] dials plain TCP through [`TcpConnector`],
//! which is enough for a local broker; to reach the real cloud pass a
//! [`Connector`] that wraps the stream in TLS to
//! [`CloudClient::with_transport`].
//!
//! ## Examples
//!
//! ```no_run
//! # tokio_test::block_on(async move {
//! use iotcloud::{CloudClient, CloudOptions, PropertyValue, Timestamp};
//!
//! // Dials `mqtts-up.broker.local:8884` over plain TCP.
//! let client = CloudClient::new();
//! client
//!     .connect(
//!         CloudOptions::new()
//!             .with_host("broker.local")
//!             .with_device_credentials("device-id", "secret-key"),
//!     )
//!     .await
//!     .unwrap();
//!
//! let thing = client.thing_id().await.unwrap();
//! client
//!     .on_property_value(&thing, "led", |value: PropertyValue| println!("led -> {:?}", value))
//!     .await
//!     .unwrap();
//! client.send_property(&thing, "temperature", 22, Timestamp::Now).await.unwrap();
//! # });
//! ```
pub mod client;
pub mod connection;
pub mod connector;
pub mod error;
pub mod options;
pub mod senml;
pub mod session;
pub mod strategy;
pub mod token;
pub mod topic;

mod codec;
mod registry;
#[cfg(test)]
mod testing;

pub use client::CloudClient;
pub use connector::{Connector, Endpoint, TcpConnector};
pub use error::{Error, Result};
pub use options::{CloudOptions, Hooks};
pub use senml::{PropertyEvent, PropertyValue, Timestamp};
pub use strategy::{Role, Strategy};
