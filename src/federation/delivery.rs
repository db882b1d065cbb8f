//! Activity delivery
//!
//! Signed outbound HTTP: fetching remote objects and posting activities
//! to remote inboxes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, header};
use rsa::RsaPrivateKey;
use serde_json::Value;

use super::signature::{ACTIVITY_ACCEPT, parse_private_key_pem, sign_request};
use crate::data::{Account, Actor};
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

/// Content type for activities we POST
pub const ACTIVITY_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Largest attachment body we download
const MAX_ATTACHMENT_BYTES: usize = 16 * 1024 * 1024;

/// Largest ActivityStreams document we accept
const MAX_OBJECT_BYTES: usize = 1024 * 1024;

/// Signing identity of a local actor
#[derive(Clone)]
pub struct Signer {
    pub actor_uri: String,
    pub key_id: String,
    private_key: Arc<RsaPrivateKey>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("actor_uri", &self.actor_uri)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(actor_uri: &str, private_key: RsaPrivateKey) -> Self {
        Self {
            actor_uri: actor_uri.to_string(),
            key_id: format!("{}#main-key", actor_uri),
            private_key: Arc::new(private_key),
        }
    }

    /// Build the signer for a local actor from its stored account
    pub fn for_actor(actor: &Actor, account: &Account) -> Result<Self, AppError> {
        let private_key = parse_private_key_pem(&account.private_key_pem)?;
        Ok(Self::new(&actor.uri, private_key))
    }

    fn sign<B: AsRef<[u8]>>(&self, request: &mut Request<B>) -> Result<(), AppError> {
        sign_request(request, &self.key_id, &self.private_key)
    }
}

/// Activity delivery service
///
/// Every call is bounded by the configured per-request timeout on top of
/// the client's own timeout.
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: Arc<reqwest::Client>,
    timeout: Duration,
}

/// Reject anything that is not an absolute http(s) URL
fn validate_remote_url(uri: &str) -> Result<url::Url, AppError> {
    let parsed =
        url::Url::parse(uri).map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", uri, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    if parsed.host_str().is_none() {
        return Err(AppError::Validation(format!("Missing host in URL: {}", uri)));
    }

    Ok(parsed)
}

impl ActivityDelivery {
    /// Create new delivery service
    pub fn new(http_client: Arc<reqwest::Client>, timeout: Duration) -> Self {
        Self {
            http_client,
            timeout,
        }
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, AppError> {
        let url = request.url().to_string();
        let _timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .start_timer();

        let response = match tokio::time::timeout(self.timeout, self.http_client.execute(request))
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound", "error"])
                    .inc();
                return Err(AppError::HttpClient(error));
            }
            Err(_) => {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound", "timeout"])
                    .inc();
                return Err(AppError::Federation(format!(
                    "Request to {} timed out after {}s",
                    url,
                    self.timeout.as_secs()
                )));
            }
        };

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", status.as_str()])
            .inc();

        if !status.is_success() {
            return Err(AppError::RemoteStatus {
                uri: url,
                status: status.as_u16(),
            });
        }

        Ok(response)
    }

    /// Fetch a remote ActivityStreams object with a signed GET
    ///
    /// The body is parsed as JSON whatever content type the server
    /// declares; older servers answer with plain `application/json` or
    /// even `text/html` for valid documents.
    pub async fn fetch_object(&self, signer: &Signer, uri: &str) -> Result<Value, AppError> {
        validate_remote_url(uri)?;

        let mut request = Request::get(uri)
            .header(header::ACCEPT, ACTIVITY_ACCEPT)
            .body(Vec::new())
            .map_err(|e| AppError::Validation(format!("Invalid request for {}: {}", uri, e)))?;
        signer.sign(&mut request)?;

        let request = reqwest::Request::try_from(request)?;
        let response = self.execute(request).await?;
        let bytes = read_capped(response, MAX_OBJECT_BYTES, uri).await?;

        serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Federation(format!("Invalid JSON from {}: {}", uri, e)))
    }

    /// Deliver activity to a single inbox
    ///
    /// # Errors
    /// Returns error if delivery fails (network, timeout, rejection)
    pub async fn deliver_to_inbox(
        &self,
        signer: &Signer,
        inbox_uri: &str,
        activity: &Value,
    ) -> Result<(), AppError> {
        validate_remote_url(inbox_uri)?;

        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let mut request = Request::post(inbox_uri)
            .header(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)
            .body(body)
            .map_err(|e| AppError::Validation(format!("Invalid request for {}: {}", inbox_uri, e)))?;
        signer.sign(&mut request)?;

        let request = reqwest::Request::try_from(request)?;
        self.execute(request).await?;

        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[activity_type])
            .inc();

        tracing::info!(
            inbox = %inbox_uri,
            activity_type,
            actor = %signer.actor_uri,
            "Delivered activity"
        );
        Ok(())
    }

    /// Download a media file for metadata extraction
    ///
    /// # Returns
    /// Declared content type (if any) and the body
    pub async fn fetch_media(&self, uri: &str) -> Result<(Option<String>, Vec<u8>), AppError> {
        validate_remote_url(uri)?;

        let request = self.http_client.get(uri).build()?;
        let response = self.execute(request).await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = read_capped(response, MAX_ATTACHMENT_BYTES, uri).await?;

        Ok((content_type, bytes))
    }
}

/// Read a response body chunk by chunk, giving up once it passes `limit`
async fn read_capped(
    mut response: reqwest::Response,
    limit: usize,
    uri: &str,
) -> Result<Vec<u8>, AppError> {
    let too_large = || AppError::Validation(format!("Response from {} exceeds {} bytes", uri, limit));

    if response
        .content_length()
        .is_some_and(|length| length > limit as u64)
    {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Run an outbound call in the background, logging instead of retrying
pub fn spawn_best_effort_delivery<F>(action: &'static str, timeout: Duration, future: F)
where
    F: Future<Output = Result<(), AppError>> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, future).await {
            Ok(Ok(())) => {
                tracing::info!(action, "Outbound federation delivery completed");
            }
            Ok(Err(error)) => {
                tracing::warn!(action, %error, "Outbound federation delivery failed");
            }
            Err(_) => {
                tracing::warn!(
                    action,
                    timeout_seconds = timeout.as_secs(),
                    "Outbound federation delivery timed out"
                );
            }
        }
    });
}

/// Activity envelope builders
pub mod builder {
    use serde_json::Value;

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity wrapping an earlier activity
    ///
    /// The inner activity loses its `@context`.
    pub fn undo(id: &str, actor: &str, mut object: Value) -> Value {
        if let Some(map) = object.as_object_mut() {
            map.remove("@context");
        }
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted (usually a Follow)
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }
}
