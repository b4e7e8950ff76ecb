//! Bearer tokens: the client-credential exchange and the claims the session reads.

use base64::prelude::*;
use futures::future::BoxFuture;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// JWT claim holding the user id used as MQTT username.
pub const USER_ID_CLAIM: &str = "http://arduino.cc/id";

/// Form body of a client-credentials grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenRequest {
    grant_type: &'static str,
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
}

impl TokenRequest {
    pub fn client_credentials(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        TokenRequest {
            grant_type: "client_credentials",
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            audience: audience.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    /// Lifetime in seconds. Some servers send it as a string.
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

fn lenient_seconds<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

/// Exchanges client credentials for a bearer token.
pub trait TokenExchange: Send + Sync {
    fn exchange<'a>(
        &'a self,
        api_url: &'a str,
        request: &'a TokenRequest,
    ) -> BoxFuture<'a, Result<AccessToken>>;
}

/// [`TokenExchange`] over HTTPS.
#[derive(Debug, Clone, Default)]
pub struct HttpTokenExchange {
    client: reqwest::Client,
}

impl HttpTokenExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpTokenExchange { client }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange<'a>(
        &'a self,
        api_url: &'a str,
        request: &'a TokenRequest,
    ) -> BoxFuture<'a, Result<AccessToken>> {
        Box::pin(async move {
            log::debug!("Requesting token for {} from {}", request.client_id, api_url);
            let response = self.client.post(api_url).form(request).send().await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(response.json().await?)
        })
    }
}

#[derive(Deserialize)]
struct Claims {
    #[serde(rename = "http://arduino.cc/id")]
    user_id: Option<String>,
}

/// Read the user id claim from a JWT without verifying its signature.
pub fn user_id_from_token(token: &str) -> Result<String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::InvalidToken("not a JWT".to_string()))?;
    let bytes = BASE64_URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::InvalidToken(e.to_string()))?;
    let claims: Claims =
        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidToken(e.to_string()))?;
    claims
        .user_id
        .ok_or_else(|| Error::InvalidToken(format!("missing {} claim", USER_ID_CLAIM)))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::fake_token;

    #[test]
    fn user_id_is_read_from_claim() {
        assert_eq!(user_id_from_token(&fake_token("user-1")).unwrap(), "user-1");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let no_claim = format!(
            "h.{}.s",
            BASE64_URL_SAFE_NO_PAD.encode(br#"{"sub":"someone"}"#)
        );
        for token in ["", "abc", "a.!!!.c", no_claim.as_str()] {
            assert!(
                matches!(user_id_from_token(token), Err(Error::InvalidToken(_))),
                "{:?} accepted",
                token
            );
        }
    }

    #[test]
    fn expires_in_accepts_numbers_and_strings() {
        let token: AccessToken =
            serde_json::from_str(r#"{"access_token":"a","expires_in":300,"token_type":"Bearer"}"#)
                .unwrap();
        assert_eq!(token.expires_in, Some(300));
        assert_eq!(token.token_type.as_deref(), Some("Bearer"));

        let token: AccessToken =
            serde_json::from_str(r#"{"access_token":"a","expires_in":"300"}"#).unwrap();
        assert_eq!(token.expires_in, Some(300));

        let token: AccessToken = serde_json::from_str(r#"{"access_token":"a"}"#).unwrap();
        assert_eq!(token.expires_in, None);
    }

    /// Serve a single HTTP request and return its raw text.
    async fn serve_once(listener: TcpListener, status: &'static str, body: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&request).to_string()
    }

    #[tokio::test]
    async fn exchange_posts_form_and_parses_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(
            listener,
            "200 OK",
            r#"{"access_token":"fresh","expires_in":300,"token_type":"Bearer"}"#,
        ));

        let request = TokenRequest::client_credentials("id", "secret", "aud");
        let token = HttpTokenExchange::new()
            .exchange(&url, &request)
            .await
            .unwrap();
        assert_eq!(token.access_token, "fresh");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /token"));
        assert!(raw
            .to_ascii_lowercase()
            .contains("content-type: application/x-www-form-urlencoded"));
        assert!(raw.ends_with(
            "grant_type=client_credentials&client_id=id&client_secret=secret&audience=aud"
        ));
    }

    #[tokio::test]
    async fn non_success_status_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        tokio::spawn(serve_once(listener, "401 Unauthorized", r#"{"error":"nope"}"#));

        let request = TokenRequest::client_credentials("id", "bad", "aud");
        let err = HttpTokenExchange::new()
            .exchange(&url, &request)
            .await
            .unwrap_err();
        match err {
            Error::Http { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("nope"));
            }
            e => panic!("Unexpected error {:?}", e),
        }
    }
}
