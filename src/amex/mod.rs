use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Identity, Method, Response, StatusCode, Url};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::credentials::{CredentialError, CredentialProvider};
use crate::retry::Backoff;

pub mod response;
pub mod sign;

pub use response::{normalize_error_code, PartnerResponse};

pub const MERCHANTS_PATH: &str = "/marketing/v4/smartoffers/offers/merchants";

const API_VERSION: &str = "5.0";
const MERCHANT_TYPE: &str = "nonoffer";
const PARTNER_ID: &str = "AADP0050";
const DATE_FORMAT: &str = "%m/%d/%Y";

const CONNECT_TIMEOUT: Duration = Duration::from_millis(3050);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("partner credentials unavailable: {0}")]
    Credentials(#[from] CredentialError),
    #[error("TLS client certificate unavailable: {0}")]
    ClientIdentityUnavailable(#[source] CredentialError),
    #[error("TLS client certificate is invalid: {0}")]
    Identity(#[source] reqwest::Error),
    #[error("request to partner failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("partner returned a non-JSON body (status {status}): {body}")]
    InvalidResponse { status: u16, body: String },
    #[error("failed to encode request payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("client secret cannot be used as an HMAC key")]
    Key,
}

/// Outcome of one partner call: the decoded body, the time the request left,
/// and the final HTTP status.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub response: PartnerResponse,
    pub sent_at: DateTime<Utc>,
    pub status: u16,
}

#[async_trait]
pub trait MerchantRegistry: Send + Sync {
    async fn add_merchant(
        &self,
        mid: &str,
        merchant_slug: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Submission, SigningError>;

    async fn delete_merchant(&self, mid: &str, merchant_slug: &str)
        -> Result<Submission, SigningError>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MerchantPayload {
    #[serde(rename = "APIVersion")]
    pub api_version: &'static str,
    pub merchant_type: &'static str,
    pub partner_id: &'static str,
    pub msg_id: String,
    pub action_code: &'static str,
    pub merchant_id: String,
    pub partner_merchant_ref_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_start_dt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_end_dt: Option<String>,
}

impl MerchantPayload {
    fn base(action_code: &'static str, mid: &str, merchant_slug: &str) -> Self {
        Self {
            api_version: API_VERSION,
            merchant_type: MERCHANT_TYPE,
            partner_id: PARTNER_ID,
            msg_id: Uuid::new_v4().to_string(),
            action_code,
            merchant_id: mid.to_string(),
            partner_merchant_ref_id: merchant_slug.to_string(),
            merchant_start_dt: None,
            merchant_end_dt: None,
        }
    }

    pub fn add(mid: &str, merchant_slug: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            merchant_start_dt: Some(start.format(DATE_FORMAT).to_string()),
            merchant_end_dt: Some(end.format(DATE_FORMAT).to_string()),
            ..Self::base("A", mid, merchant_slug)
        }
    }

    pub fn delete(mid: &str, merchant_slug: &str) -> Self {
        Self::base("D", mid, merchant_slug)
    }
}

/// Transport-level retries. Connection failures are retried for every
/// method; 500/503/504 only for idempotent ones. The delay before retry `n`
/// is `backoff_factor * 2^(n-1)` seconds, with no wait before the first.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportRetry {
    pub max_retries: u32,
    pub backoff_factor: f64,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 0.3,
        }
    }
}

impl TransportRetry {
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.backoff_factor * 2f64.powi(retry as i32 - 1))
    }

    pub fn retries_status(&self, method: &Method, status: StatusCode) -> bool {
        let idempotent = matches!(
            *method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
        );
        idempotent
            && matches!(
                status,
                StatusCode::INTERNAL_SERVER_ERROR
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            )
    }
}

/// Signing HTTPS client for the merchant registration API.
#[derive(Clone)]
pub struct AmexClient {
    api_host: String,
    authority: String,
    credentials: Arc<dyn CredentialProvider>,
    require_client_cert: bool,
    identity_backoff: Backoff,
    transport: TransportRetry,
}

impl fmt::Debug for AmexClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmexClient")
            .field("api_host", &self.api_host)
            .field("require_client_cert", &self.require_client_cert)
            .finish_non_exhaustive()
    }
}

impl AmexClient {
    pub fn new(api_host: &str, credentials: Arc<dyn CredentialProvider>) -> anyhow::Result<Self> {
        let api_host = api_host.trim_end_matches('/').to_string();
        let url = Url::parse(&api_host).with_context(|| format!("invalid API host {}", api_host))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("API host {} has no host name", api_host))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        Ok(Self {
            api_host,
            authority,
            credentials,
            require_client_cert: false,
            identity_backoff: Backoff::credential_fetch(),
            transport: TransportRetry::default(),
        })
    }

    pub fn require_client_cert(mut self, required: bool) -> Self {
        self.require_client_cert = required;
        self
    }

    pub fn with_identity_backoff(mut self, backoff: Backoff) -> Self {
        self.identity_backoff = backoff;
        self
    }

    pub fn with_transport_retry(mut self, transport: TransportRetry) -> Self {
        self.transport = transport;
        self
    }

    /// The `host[:port]` that goes into the canonical string.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    async fn resolve_identity(&self) -> Result<Identity, SigningError> {
        let identity = self
            .identity_backoff
            .run(
                || self.credentials.client_identity(),
                CredentialError::is_transient,
            )
            .await
            .map_err(SigningError::ClientIdentityUnavailable)?;
        Identity::from_pem(&identity.to_pem_bundle()).map_err(SigningError::Identity)
    }

    async fn http_client(&self) -> Result<Client, SigningError> {
        let mut builder = Client::builder()
            .user_agent(concat!("mid-onboard/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        match self.resolve_identity().await {
            Ok(identity) => builder = builder.identity(identity),
            Err(err) if self.require_client_cert => return Err(err),
            Err(err) => error!(%err, "sending without a TLS client certificate"),
        }
        Ok(builder.build()?)
    }

    #[instrument(skip_all, fields(method = %method, path = %path))]
    async fn call(
        &self,
        method: Method,
        path: &str,
        payload: &MerchantPayload,
    ) -> Result<Submission, SigningError> {
        let credentials = self.credentials.client_credentials().await?;
        let http = self.http_client().await?;
        let body = serde_json::to_string(payload)?;
        let headers = sign::sign(
            &credentials,
            method.as_str(),
            path,
            &self.authority,
            &body,
            sign::epoch_millis(Utc::now()),
            Uuid::new_v4(),
        )?;
        let url = format!("{}{}", self.api_host, path);
        debug!(%url, payload = %body, "partner request");

        let build = || {
            let mut req = http.request(method.clone(), url.as_str());
            for (name, value) in headers.pairs() {
                req = req.header(name, value);
            }
            req.body(body.clone()).build()
        };

        let sent_at = Utc::now();
        let res = self.send_with_retry(&http, &method, build).await?;
        let status = res.status().as_u16();
        let text = res.text().await?;
        info!(status, "partner response");
        let raw: serde_json::Value =
            serde_json::from_str(&text).map_err(|_| SigningError::InvalidResponse {
                status,
                body: text.clone(),
            })?;

        Ok(Submission {
            response: PartnerResponse::from_value(raw),
            sent_at,
            status,
        })
    }

    async fn send_with_retry(
        &self,
        http: &Client,
        method: &Method,
        build: impl Fn() -> Result<reqwest::Request, reqwest::Error>,
    ) -> Result<Response, SigningError> {
        let mut retries = 0;
        loop {
            match http.execute(build()?).await {
                Ok(res)
                    if retries < self.transport.max_retries
                        && self.transport.retries_status(method, res.status()) =>
                {
                    retries += 1;
                    warn!(status = %res.status(), retries, "partner unavailable; retrying");
                }
                Ok(res) => return Ok(res),
                Err(err) if err.is_connect() && retries < self.transport.max_retries => {
                    retries += 1;
                    warn!(%err, retries, "connection to partner failed; retrying");
                }
                Err(err) => return Err(err.into()),
            }
            tokio::time::sleep(self.transport.delay_for(retries)).await;
        }
    }
}

#[async_trait]
impl MerchantRegistry for AmexClient {
    async fn add_merchant(
        &self,
        mid: &str,
        merchant_slug: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Submission, SigningError> {
        let payload = MerchantPayload::add(mid, merchant_slug, start, end);
        self.call(Method::POST, MERCHANTS_PATH, &payload).await
    }

    async fn delete_merchant(
        &self,
        mid: &str,
        merchant_slug: &str,
    ) -> Result<Submission, SigningError> {
        let payload = MerchantPayload::delete(mid, merchant_slug);
        let path = format!("{}/{}", MERCHANTS_PATH, mid);
        self.call(Method::DELETE, &path, &payload).await
    }
}
