//! `reqwest` binding for the HSM REST API.
//!
//! # Design
//! - One bearer token per client, fetched lazily and reused until the API
//!   answers `401`, at which point the client logs in again once and retries.
//! - Query strings are built with `url` so paths containing spaces or `&`
//!   survive the round trip.

use std::fmt;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use stratum_config::HsmConfig;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::api::{BlockStatus, Filesystem, HsmApi};
use crate::error::{StagingError, StagingResult};

const LOGIN_ENDPOINT: &str = "security/login";
const FILESYSTEMS_ENDPOINT: &str = "filesystems";
const FILE_ENDPOINT: &str = "file";
const REQUEST_ENDPOINT: &str = "request";
const QUEUES_ENDPOINT: &str = "queues";

#[derive(Serialize)]
struct LoginRequest<'a> {
    acct: &'a str,
    pass: &'a str,
}

/// Authenticated HSM API client.
pub struct HsmClient {
    http: Client,
    base: Url,
    account: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl fmt::Debug for HsmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmClient")
            .field("base", &self.base.as_str())
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl HsmClient {
    /// Build a client from the `hsm` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Config`] when the URL or credentials are
    /// missing or invalid, and [`StagingError::Http`] when the HTTP client
    /// cannot be constructed.
    pub fn from_config(config: &HsmConfig) -> StagingResult<Self> {
        let api_url = config.api_url.as_deref().ok_or(StagingError::Config {
            reason: "api_url is required",
            value: None,
        })?;
        let (Some(account), Some(password)) = (&config.account, &config.password) else {
            return Err(StagingError::Config {
                reason: "account and password are required",
                value: None,
            });
        };

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|source| StagingError::Http {
                endpoint: "client",
                source,
            })?;

        Self::with_http(http, api_url, account, password)
    }

    /// Build a client around an existing `reqwest` client.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Config`] when `api_url` is not an absolute URL.
    pub fn with_http(
        http: Client,
        api_url: &str,
        account: impl Into<String>,
        password: impl Into<String>,
    ) -> StagingResult<Self> {
        Ok(Self {
            http,
            base: base_url(api_url)?,
            account: account.into(),
            password: password.into(),
            token: Mutex::new(None),
        })
    }

    /// Seed a previously issued token, skipping the first login.
    #[must_use]
    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
            ..self
        }
    }

    /// Base URL every endpoint is resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    /// Exchange the configured credentials for a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Authentication`] on `401`/`403`, and
    /// [`StagingError::Decode`] when the response carries no token.
    pub async fn login(&self) -> StagingResult<String> {
        let url = self.endpoint(LOGIN_ENDPOINT)?;
        let response = self
            .http
            .post(url)
            .json(&LoginRequest {
                acct: &self.account,
                pass: &self.password,
            })
            .send()
            .await
            .map_err(|source| StagingError::Http {
                endpoint: LOGIN_ENDPOINT,
                source,
            })?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(StagingError::Authentication {
                status: status.as_u16(),
            });
        }
        let body = read_json(LOGIN_ENDPOINT, ensure_success(LOGIN_ENDPOINT, response)?).await?;
        let token = body
            .get("response")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or(StagingError::Decode {
                endpoint: LOGIN_ENDPOINT,
                field: "response",
            })?;
        debug!(account = %self.account, "hsm login succeeded");
        Ok(token.to_string())
    }

    async fn token(&self) -> StagingResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn discard_token(&self, rejected: &str) {
        let mut guard = self.token.lock().await;
        if guard.as_deref() == Some(rejected) {
            *guard = None;
        }
    }

    async fn send_authorized<F>(&self, endpoint: &'static str, build: F) -> StagingResult<Response>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let token = self.token().await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|source| StagingError::Http { endpoint, source })?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return ensure_success(endpoint, response);
        }

        warn!(endpoint, "hsm token rejected; logging in again");
        self.discard_token(&token).await;
        let token = self.token().await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|source| StagingError::Http { endpoint, source })?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(StagingError::Authentication {
                status: response.status().as_u16(),
            });
        }
        ensure_success(endpoint, response)
    }

    fn endpoint(&self, relative: &str) -> StagingResult<Url> {
        self.base.join(relative).map_err(|_| StagingError::Config {
            reason: "endpoint path invalid",
            value: Some(relative.to_string()),
        })
    }

    fn file_url(&self, relative: &str, fsid: &str, path: &str) -> StagingResult<Url> {
        let mut url = self.endpoint(relative)?;
        url.query_pairs_mut()
            .append_pair("fsid", fsid)
            .append_pair("path", path);
        Ok(url)
    }
}

#[async_trait]
impl HsmApi for HsmClient {
    async fn filesystems(&self) -> StagingResult<Vec<Filesystem>> {
        let url = self.endpoint(FILESYSTEMS_ENDPOINT)?;
        let response = self
            .send_authorized(FILESYSTEMS_ENDPOINT, |token| {
                self.http.get(url.clone()).bearer_auth(token)
            })
            .await?;
        let body = read_json(FILESYSTEMS_ENDPOINT, response).await?;
        parse_filesystems(&body)
    }

    async fn file_status(&self, fsid: &str, path: &str) -> StagingResult<BlockStatus> {
        let url = self.file_url(FILE_ENDPOINT, fsid, path)?;
        let response = self
            .send_authorized(FILE_ENDPOINT, |token| {
                self.http.get(url.clone()).bearer_auth(token)
            })
            .await?;
        let body = read_json(FILE_ENDPOINT, response).await?;
        Ok(BlockStatus::from_value(&body))
    }

    async fn request(&self, command: &str, fsid: &str, path: &str) -> StagingResult<()> {
        let url = self.file_url(&format!("{REQUEST_ENDPOINT}/{command}"), fsid, path)?;
        self.send_authorized(REQUEST_ENDPOINT, |token| {
            self.http.post(url.clone()).bearer_auth(token)
        })
        .await?;
        debug!(command, fsid, path, "hsm request accepted");
        Ok(())
    }

    async fn queues(&self) -> StagingResult<Value> {
        let url = self.endpoint(QUEUES_ENDPOINT)?;
        let response = self
            .send_authorized(QUEUES_ENDPOINT, |token| {
                self.http.get(url.clone()).bearer_auth(token)
            })
            .await?;
        read_json(QUEUES_ENDPOINT, response).await
    }
}

fn base_url(raw: &str) -> StagingResult<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|_| StagingError::Config {
        reason: "api_url must be an absolute URL",
        value: Some(raw.to_string()),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn ensure_success(endpoint: &'static str, response: Response) -> StagingResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StagingError::RemoteService {
            endpoint,
            status: status.as_u16(),
        })
    }
}

async fn read_json(endpoint: &'static str, response: Response) -> StagingResult<Value> {
    response
        .json::<Value>()
        .await
        .map_err(|source| StagingError::Http { endpoint, source })
}

fn parse_filesystems(body: &Value) -> StagingResult<Vec<Filesystem>> {
    let malformed = StagingError::Decode {
        endpoint: FILESYSTEMS_ENDPOINT,
        field: "fsids",
    };
    let Some(entries) = body.get("fsids").and_then(Value::as_array) else {
        return Err(malformed);
    };
    entries
        .iter()
        .map(|entry| {
            let fsid = match entry.get("fsid") {
                Some(Value::String(text)) => Some(text.clone()),
                Some(Value::Number(number)) => Some(number.to_string()),
                _ => None,
            };
            let mount = entry.get("mount").and_then(Value::as_str);
            match (fsid, mount) {
                (Some(fsid), Some(mount)) => Ok(Filesystem::new(fsid, mount)),
                _ => Err(StagingError::Decode {
                    endpoint: FILESYSTEMS_ENDPOINT,
                    field: "fsids",
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_url_gains_trailing_slash() -> anyhow::Result<()> {
        let url = base_url("https://hsm.example:8080/v1")?;
        assert_eq!(url.as_str(), "https://hsm.example:8080/v1/");
        assert_eq!(
            url.join(FILESYSTEMS_ENDPOINT)?.as_str(),
            "https://hsm.example:8080/v1/filesystems"
        );
        assert!(base_url("not a url").is_err());
        Ok(())
    }

    #[test]
    fn filesystems_accept_numeric_ids() -> anyhow::Result<()> {
        let parsed = parse_filesystems(&json!({
            "fsids": [{"fsid": 3, "mount": "/hsm"}, {"fsid": "x7", "mount": "/scratch"}]
        }))?;
        assert_eq!(
            parsed,
            vec![Filesystem::new("3", "/hsm"), Filesystem::new("x7", "/scratch")]
        );
        assert!(parse_filesystems(&json!({"fsids": [{"mount": "/hsm"}]})).is_err());
        assert!(parse_filesystems(&json!({})).is_err());
        Ok(())
    }

    #[test]
    fn debug_output_hides_credentials() -> anyhow::Result<()> {
        let client = HsmClient::with_http(Client::new(), "https://hsm/v1", "filestat", "secret")?
            .with_token("tok");
        let rendered = format!("{client:?}");
        assert!(rendered.contains("filestat"));
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("tok\""));
        Ok(())
    }
}
