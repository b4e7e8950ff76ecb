//! Choosing how to authenticate from the options that were supplied.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{Connection, Credentials};
use crate::connector::{Connector, Endpoint};
use crate::error::{Error, Result};
use crate::options::{CloudOptions, DEVICE_PORT, USER_PORT};
use crate::senml::PropertyValue;
use crate::token::{TokenExchange, TokenRequest};
use crate::topic;

/// How long a device waits for the cloud to announce its thing.
pub const THING_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// A bearer token was supplied.
    Token,
    /// Device id and secret key.
    DeviceCredentials,
    /// OAuth client id and secret, exchanged for a token first.
    ClientCredentials,
}

/// Which side of a thing's property topics the session is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Sends to a thing's input, listens on its output.
    User,
    /// Acts as the device bound to `thing_id`: sends to its output, listens on its input.
    Device { device_id: String, thing_id: String },
}

impl Role {
    pub fn send_topic(&self, thing_id: &str) -> String {
        match self {
            Role::User => topic::thing_inbound(thing_id),
            Role::Device { .. } => topic::thing_outbound(thing_id),
        }
    }

    pub fn listen_topic(&self, thing_id: &str) -> String {
        match self {
            Role::User => topic::thing_outbound(thing_id),
            Role::Device { .. } => topic::thing_inbound(thing_id),
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Role::User => None,
            Role::Device { device_id, .. } => Some(device_id),
        }
    }

    pub fn thing_id(&self) -> Option<&str> {
        match self {
            Role::User => None,
            Role::Device { thing_id, .. } => Some(thing_id),
        }
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl Strategy {
    /// First match wins: token, then device credentials, then client credentials.
    ///
    /// ```
    /// use iotcloud::{CloudOptions, Strategy};
    ///
    /// let options = CloudOptions::new()
    ///     .with_token("x")
    ///     .with_client_credentials("y", "z");
    /// assert_eq!(Strategy::select(&options).unwrap(), Strategy::Token);
    /// assert!(Strategy::select(&CloudOptions::new()).is_err());
    /// ```
    pub fn select(options: &CloudOptions) -> Result<Self> {
        if present(&options.token).is_some() {
            Ok(Strategy::Token)
        } else if present(&options.device_id).is_some() && present(&options.secret_key).is_some() {
            Ok(Strategy::DeviceCredentials)
        } else if present(&options.client_id).is_some()
            && present(&options.client_secret).is_some()
        {
            Ok(Strategy::ClientCredentials)
        } else {
            Err(Error::InvalidOptions)
        }
    }

    /// Where this strategy connects. Both cloud ports expect TLS, which the
    /// [`Connector`] has to provide.
    pub fn endpoint(self, options: &CloudOptions) -> Endpoint {
        match self {
            Strategy::Token | Strategy::ClientCredentials => Endpoint::new(
                format!("wss.{}", options.host),
                options.port.unwrap_or(USER_PORT),
            ),
            Strategy::DeviceCredentials => Endpoint::new(
                format!("mqtts-up.{}", options.host),
                options.port.unwrap_or(DEVICE_PORT),
            ),
        }
    }

    /// Authenticate and return a connected [`Connection`].
    pub(crate) async fn establish(
        self,
        options: &CloudOptions,
        connector: Arc<dyn Connector>,
        exchange: &dyn TokenExchange,
    ) -> Result<(Connection, Role)> {
        if options.host.is_empty() {
            return Err(Error::InvalidOptions);
        }
        let endpoint = self.endpoint(options);
        let hooks = options.hooks.clone();

        match self {
            Strategy::Token => {
                let token = present(&options.token).ok_or(Error::InvalidOptions)?;
                let mut connection =
                    Connection::new(connector, endpoint, Credentials::Token(token.to_string()), hooks);
                connection.connect().await?;
                Ok((connection, Role::User))
            }
            Strategy::ClientCredentials => {
                let (Some(client_id), Some(client_secret)) =
                    (present(&options.client_id), present(&options.client_secret))
                else {
                    return Err(Error::InvalidOptions);
                };
                let request =
                    TokenRequest::client_credentials(client_id, client_secret, &options.audience);
                let token = exchange.exchange(&options.api_url, &request).await?;
                log::debug!(
                    "Obtained {} token valid for {:?}s",
                    token.token_type.as_deref().unwrap_or("bearer"),
                    token.expires_in
                );

                let mut connection = Connection::new(
                    connector,
                    endpoint,
                    Credentials::Token(token.access_token),
                    hooks,
                );
                connection.connect().await?;
                Ok((connection, Role::User))
            }
            Strategy::DeviceCredentials => {
                let (Some(device_id), Some(secret_key)) =
                    (present(&options.device_id), present(&options.secret_key))
                else {
                    return Err(Error::InvalidOptions);
                };
                let credentials = Credentials::Device {
                    device_id: device_id.to_string(),
                    secret_key: secret_key.to_string(),
                };
                let mut connection = Connection::new(connector, endpoint, credentials, hooks);
                connection.connect().await?;

                match await_thing(&connection, device_id).await {
                    Ok(thing_id) => {
                        log::debug!("Device {} is attached to thing {}", device_id, thing_id);
                        let role = Role::Device {
                            device_id: device_id.to_string(),
                            thing_id,
                        };
                        Ok((connection, role))
                    }
                    Err(e) => {
                        let _ = connection.end(true).await;
                        Err(e)
                    }
                }
            }
        }
    }
}

/// Subscribe to the association topic and wait for the thing id.
async fn await_thing(connection: &Connection, device_id: &str) -> Result<String> {
    let association = topic::device_association(device_id);
    let mut messages = connection.messages()?;
    connection.subscribe(&association).await?;

    let announcement = async {
        loop {
            match messages.recv().await {
                Some(event) if event.topic == association => match event.value {
                    PropertyValue::String(thing_id) => return Ok(thing_id),
                    other => log::warn!("Ignoring non-text thing announcement {:?}", other),
                },
                Some(_) => {}
                None => {
                    return Err(Error::ConnectionFailed(
                        "connection closed before thing was announced".to_string(),
                    ))
                }
            }
        }
    };

    match tokio::time::timeout(THING_ANNOUNCE_TIMEOUT, announcement).await {
        Ok(Ok(thing_id)) if !thing_id.is_empty() => Ok(thing_id),
        Ok(Err(e)) => Err(e),
        Ok(Ok(_)) | Err(_) => Err(Error::NoThingAssociated {
            device_id: device_id.to_string(),
        }),
    }
}
