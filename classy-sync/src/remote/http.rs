//! HTTP implementation of [`RemoteStatusClient`] using reqwest.
//!
//! Responses are classified into the [`SyncError`] taxonomy here, at the
//! client boundary:
//!
//! | Outcome | Error |
//! |---|---|
//! | 401, 403 | [`SyncError::Unauthorized`] |
//! | 409 | [`SyncError::Conflict`] |
//! | 408, 429, 5xx, timeouts, connect failures | [`SyncError::Network`] |
//! | other 4xx, undecodable body | [`SyncError::ServerRejected`] |

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, instrument};
use url::Url;

use super::{
    RemoteStatusClient,
    config::{EndpointConfig, HttpConfig, HttpVersion, ServerConfig},
};
use crate::{
    error::{Result, SyncError},
    models::{
        AccountCredential, Ack, ContentResource, PurchaseEvent, SubscriptionStatus,
        SubscriptionStatusList,
    },
};

/// Longest slice of a response body copied into an error message.
const MAX_ERROR_BODY: usize = 200;

/// Backend operations, used for endpoint lookup and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    ContentBasic,
    ContentPremium,
    SubscriptionStatus,
    RegisterSubscription,
    TransferSubscription,
    RegisterInstanceId,
    UnregisterInstanceId,
}

impl Operation {
    const fn name(self) -> &'static str {
        match self {
            Self::ContentBasic => "content_basic",
            Self::ContentPremium => "content_premium",
            Self::SubscriptionStatus => "subscription_status",
            Self::RegisterSubscription => "register_subscription",
            Self::TransferSubscription => "transfer_subscription",
            Self::RegisterInstanceId => "register_instance_id",
            Self::UnregisterInstanceId => "unregister_instance_id",
        }
    }

    fn method(self) -> Method {
        match self {
            Self::ContentBasic | Self::ContentPremium | Self::SubscriptionStatus => Method::GET,
            Self::RegisterSubscription
            | Self::TransferSubscription
            | Self::RegisterInstanceId
            | Self::UnregisterInstanceId => Method::PUT,
        }
    }

    fn path(self, endpoints: &EndpointConfig) -> &str {
        match self {
            Self::ContentBasic => &endpoints.content_basic,
            Self::ContentPremium => &endpoints.content_premium,
            Self::SubscriptionStatus => &endpoints.subscription_status,
            Self::RegisterSubscription => &endpoints.register_subscription,
            Self::TransferSubscription => &endpoints.transfer_subscription,
            Self::RegisterInstanceId => &endpoints.register_instance_id,
            Self::UnregisterInstanceId => &endpoints.unregister_instance_id,
        }
    }
}

/// Maps a non-success HTTP status to the error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let message: String = body.chars().take(MAX_ERROR_BODY).collect();
    match status.as_u16() {
        401 | 403 => SyncError::Unauthorized(format!("server returned {status}")),
        409 => SyncError::Conflict(if message.is_empty() {
            "purchase is bound to another account".to_owned()
        } else {
            message
        }),
        408 | 429 => SyncError::Network(format!("server returned {status}")),
        code if status.is_server_error() => SyncError::Network(format!("server returned {code}")),
        code => SyncError::ServerRejected { status: code, message },
    }
}

/// Maps a reqwest failure to the error taxonomy.
#[allow(
    clippy::needless_pass_by_value,
    reason = "used as a map_err adapter that consumes the error"
)]
fn classify_transport(error: reqwest::Error) -> SyncError {
    if error.is_decode() {
        return SyncError::ServerRejected {
            status: error.status().map_or(0, |s| s.as_u16()),
            message: error.to_string(),
        };
    }
    if let Some(status) = error.status() {
        return classify_status(status, "");
    }
    SyncError::Network(error.to_string())
}

/// reqwest-backed subscription-status client.
///
/// Holds one pooled [`Client`]; clone-free sharing goes through `Arc`.
#[derive(Debug)]
pub struct HttpStatusClient {
    client: Client,
    base_url: Url,
    endpoints: EndpointConfig,
    http_version: HttpVersion,
}

impl HttpStatusClient {
    /// Creates a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the server or HTTP configuration is
    /// invalid or the HTTP client cannot be built.
    pub fn new(server: &ServerConfig, http: &HttpConfig) -> Result<Self> {
        server.validate()?;
        http.validate()?;

        let mut builder = Client::builder()
            .pool_max_idle_per_host(http.pool_max_idle_per_host)
            .timeout(http.timeout())
            .connect_timeout(http.connect_timeout());

        builder = match http.http_version {
            HttpVersion::Http1 => builder.http1_only(),
            HttpVersion::Http2 => builder.http2_prior_knowledge(),
            HttpVersion::Auto => builder,
        };

        let client = builder
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: server.parsed_base_url()?,
            endpoints: server.endpoints.clone(),
            http_version: http.http_version,
        })
    }

    /// Returns the protocol name for logging.
    #[must_use]
    pub fn protocol_name(&self) -> &'static str {
        match self.http_version {
            HttpVersion::Http1 => "http/1.1",
            HttpVersion::Http2 => "http/2",
            HttpVersion::Auto => "http",
        }
    }

    fn url_for(&self, operation: Operation) -> Result<Url> {
        self.base_url
            .join(operation.path(&self.endpoints))
            .map_err(|e| SyncError::Config(format!("invalid {} endpoint: {e}", operation.name())))
    }

    /// Sends one request and returns the body of a successful response.
    #[instrument(
        skip(self, credential, body),
        fields(operation = operation.name(), account = %credential.account_id(), status)
    )]
    async fn execute(
        &self,
        operation: Operation,
        credential: &AccountCredential,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let url = self.url_for(operation)?;

        let mut request =
            self.client.request(operation.method(), url).bearer_auth(credential.token());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        tracing::Span::current().record("status", status.as_u16());

        let bytes = response.bytes().await.map_err(classify_transport)?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            let error = classify_status(status, &text);
            debug!(error = %error, "Request failed");
            return Err(error);
        }

        debug!(bytes = bytes.len(), "Request succeeded");
        Ok((status, bytes.to_vec()))
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        operation: Operation,
        credential: &AccountCredential,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let (status, bytes) = self.execute(operation, credential, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::ServerRejected {
            status: status.as_u16(),
            message: format!("undecodable {} response: {e}", operation.name()),
        })
    }

    async fn execute_ack(
        &self,
        operation: Operation,
        credential: &AccountCredential,
        instance_id: &str,
    ) -> Result<Ack> {
        if instance_id.is_empty() {
            return Err(SyncError::InvalidInput("instance_id cannot be empty".to_owned()));
        }
        let body = json!({ "instanceId": instance_id });
        let (_, bytes) = self.execute(operation, credential, Some(body)).await?;
        Ok(Ack(String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn purchase_body(purchase: &PurchaseEvent) -> Result<serde_json::Value> {
        serde_json::to_value(SubscriptionStatus::for_purchase(purchase))
            .map_err(|e| SyncError::InvalidInput(format!("cannot encode purchase: {e}")))
    }
}

impl RemoteStatusClient for HttpStatusClient {
    async fn fetch_subscription_status<'a>(
        &'a self,
        credential: &'a AccountCredential,
    ) -> Result<SubscriptionStatusList> {
        self.execute_json(Operation::SubscriptionStatus, credential, None).await
    }

    async fn register_subscription<'a>(
        &'a self,
        credential: &'a AccountCredential,
        purchase: &'a PurchaseEvent,
    ) -> Result<SubscriptionStatusList> {
        let body = Self::purchase_body(purchase)?;
        self.execute_json(Operation::RegisterSubscription, credential, Some(body)).await
    }

    async fn transfer_subscription<'a>(
        &'a self,
        credential: &'a AccountCredential,
        purchase: &'a PurchaseEvent,
    ) -> Result<SubscriptionStatusList> {
        let body = Self::purchase_body(purchase)?;
        self.execute_json(Operation::TransferSubscription, credential, Some(body)).await
    }

    async fn register_instance_id<'a>(
        &'a self,
        credential: &'a AccountCredential,
        instance_id: &'a str,
    ) -> Result<Ack> {
        self.execute_ack(Operation::RegisterInstanceId, credential, instance_id).await
    }

    async fn unregister_instance_id<'a>(
        &'a self,
        credential: &'a AccountCredential,
        instance_id: &'a str,
    ) -> Result<Ack> {
        self.execute_ack(Operation::UnregisterInstanceId, credential, instance_id).await
    }

    async fn fetch_basic_content<'a>(
        &'a self,
        credential: &'a AccountCredential,
    ) -> Result<ContentResource> {
        self.execute_json(Operation::ContentBasic, credential, None).await
    }

    async fn fetch_premium_content<'a>(
        &'a self,
        credential: &'a AccountCredential,
    ) -> Result<ContentResource> {
        self.execute_json(Operation::ContentPremium, credential, None).await
    }
}
