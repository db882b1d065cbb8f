//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Both directions build the canonical signing string through
//! [`signing_string`], so a request we sign verifies with the same code
//! that checks inbound traffic.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, Method, Request, header};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// HTTP-date layout used for the `Date` header
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Accept header sent on signed fetches
///
/// Some servers only answer to one of these, so all three are offered.
pub const ACTIVITY_ACCEPT: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\", application/json";

/// Maximum distance between the `Date` header and our clock
const MAX_DATE_SKEW_SECONDS: i64 = 12 * 60 * 60;

const GET_SIGNED_HEADERS: &[&str] = &["(request-target)", "host", "date", "accept"];
const POST_SIGNED_HEADERS: &[&str] = &["(request-target)", "date", "digest"];

/// Resolves the public key behind a signature `keyId`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn public_key(&self, key_id: &str) -> Result<RsaPublicKey, AppError>;
}

/// Sign an outgoing HTTP request in place
///
/// Sets `Date`, fills in `Host` from the URI if absent, and sets `Digest`
/// for requests with a body (anything but GET). GET requests without an
/// `Accept` header get [`ACTIVITY_ACCEPT`].
///
/// # Arguments
/// * `request` - Request to sign; its URI must be absolute
/// * `key_id` - Full URL to the public key (actor#main-key)
/// * `private_key` - Signer's RSA private key
pub fn sign_request<B: AsRef<[u8]>>(
    request: &mut Request<B>,
    key_id: &str,
    private_key: &RsaPrivateKey,
) -> Result<(), AppError> {
    let date = Utc::now().format(HTTP_DATE_FORMAT).to_string();
    request
        .headers_mut()
        .insert(header::DATE, header_value(&date)?);

    if !request.headers().contains_key(header::HOST) {
        let host = request
            .uri()
            .authority()
            .map(|authority| authority.as_str().to_string())
            .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
        request
            .headers_mut()
            .insert(header::HOST, header_value(&host)?);
    }

    let signed_headers = if request.method() == Method::GET {
        if !request.headers().contains_key(header::ACCEPT) {
            request
                .headers_mut()
                .insert(header::ACCEPT, HeaderValue::from_static(ACTIVITY_ACCEPT));
        }
        GET_SIGNED_HEADERS
    } else {
        let digest = generate_digest(request.body().as_ref());
        request
            .headers_mut()
            .insert("digest", header_value(&digest)?);
        POST_SIGNED_HEADERS
    };

    let names: Vec<String> = signed_headers.iter().map(|h| h.to_string()).collect();
    let signing_string = signing_string(request.method(), request.uri(), request.headers(), &names)?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key
        .try_sign_with_rng(&mut rng, signing_string.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Signing failed: {}", e)))?;

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        names.join(" "),
        BASE64.encode(signature.to_bytes())
    );
    request
        .headers_mut()
        .insert("signature", header_value(&signature_header)?);

    Ok(())
}

/// Verify an inbound HTTP request signature
///
/// Rebuilds the signing string from the headers the sender declared,
/// checks the body digest and date, and verifies against the key returned
/// by `resolver`.
///
/// # Returns
/// The verified `keyId`
///
/// # Errors
/// `AppError::Signature` for every authentication failure, including a
/// key that cannot be resolved.
pub async fn verify_request<B, K>(request: &Request<B>, resolver: &K) -> Result<String, AppError>
where
    B: AsRef<[u8]>,
    K: KeyResolver + ?Sized,
{
    let headers = request.headers();

    // 1. Parse Signature header
    let signature_header = headers
        .get("signature")
        .ok_or_else(|| AppError::Signature("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Signature("Invalid Signature header".to_string()))?;
    let parsed = parse_signature_header(signature_header)?;

    // 2. Validate algorithm and required signed headers.
    let algorithm = parsed.algorithm.to_ascii_lowercase();
    if algorithm != "rsa-sha256" && algorithm != "hs2019" {
        return Err(AppError::Signature(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Signature(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    let body = request.body().as_ref();
    if request.method() != Method::GET && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Signature(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // 3. Verify Date is recent.
    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Signature("Invalid Date format".to_string()))?;
    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > MAX_DATE_SKEW_SECONDS {
        return Err(AppError::Signature(
            "Date header too old or in future".to_string(),
        ));
    }

    // 4. If a digest is present, it must match the body.
    if let Some(digest) = headers.get("digest") {
        let digest = digest
            .to_str()
            .map_err(|_| AppError::Signature("Invalid Digest header".to_string()))?;
        if !digest_matches(digest, body) {
            return Err(AppError::Signature("Digest mismatch".to_string()));
        }
    }

    // 5. Reconstruct signing string.
    let signing_string = signing_string(request.method(), request.uri(), headers, &parsed.headers)?;

    // 6. Resolve key and verify RSA signature.
    let public_key = resolver.public_key(&parsed.key_id).await.map_err(|e| {
        AppError::Signature(format!("Unable to resolve key {}: {}", parsed.key_id, e))
    })?;

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Signature("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Signature(format!("Invalid signature format: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);
    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Signature("Signature verification failed".to_string()))?;

    Ok(parsed.key_id)
}

/// Build the canonical string covered by a signature
///
/// One `name: value` line per listed header, in the listed order.
/// `(request-target)` is `lowercase-method path[?query]`. Repeated headers
/// are joined with ", ".
pub fn signing_string(
    method: &Method,
    uri: &http::Uri,
    headers: &HeaderMap,
    names: &[String],
) -> Result<String, AppError> {
    let mut lines = Vec::with_capacity(names.len());

    for name in names {
        let value = if name == "(request-target)" {
            let path = uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            format!("{} {}", method.as_str().to_lowercase(), path)
        } else if name.starts_with('(') {
            return Err(AppError::Signature(format!(
                "Unsupported pseudo-header in signature: {}",
                name
            )));
        } else {
            let values: Vec<&str> = headers
                .get_all(name.as_str())
                .iter()
                .map(|v| v.to_str().map(str::trim))
                .collect::<Result<_, _>>()
                .map_err(|_| AppError::Signature(format!("Invalid {} header", name)))?;
            if values.is_empty() {
                return Err(AppError::Signature(format!("Missing {} header", name)));
            }
            values.join(", ")
        };

        lines.push(format!("{}: {}", name, value));
    }

    Ok(lines.join("\n"))
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    actor_uri_from_key_id(key_id) == actor_uri_from_key_id(actor_id)
}

/// Strip the `#fragment` from a key ID, leaving the owning actor URI
pub fn actor_uri_from_key_id(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// A missing `algorithm` defaults to `hs2019`; a missing `headers` list
/// defaults to `date`, as the draft specifies.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Remove quotes from value
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Signature("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Signature("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Check a `Digest` header against the body
///
/// The header may list several algorithms; the SHA-256 entry is compared
/// and other entries are ignored.
fn digest_matches(header: &str, body: &[u8]) -> bool {
    let expected = generate_digest(body);
    let expected_value = &expected["SHA-256=".len()..];

    header.split(',').any(|entry| {
        entry
            .trim()
            .split_once('=')
            .is_some_and(|(algorithm, value)| {
                algorithm.eq_ignore_ascii_case("sha-256") && value == expected_value
            })
    })
}

/// Parse a PEM public key, accepting SPKI and PKCS#1 encodings
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| AppError::Signature(format!("Invalid public key: {}", e)))
}

/// Parse a PEM private key, accepting PKCS#8 and PKCS#1 encodings
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(pem.trim())
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|_| AppError::Validation(format!("Invalid header value: {}", value)))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Signature(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Signature(format!("Invalid {} header", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    const KEY_ID: &str = "https://remote.example/users/alice#main-key";

    fn generate_test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        let public_key = RsaPublicKey::from(&private_key);
        (private_key, public_key)
    }

    fn resolver_for(public_key: RsaPublicKey) -> MockKeyResolver {
        let mut resolver = MockKeyResolver::new();
        resolver
            .expect_public_key()
            .returning(move |_| Ok(public_key.clone()));
        resolver
    }

    fn signed_post(private_key: &RsaPrivateKey) -> Request<Vec<u8>> {
        let mut request = Request::post("https://local.example/users/bob/inbox?foo=bar")
            .header(header::CONTENT_TYPE, "application/activity+json")
            .body(br#"{"type":"Follow"}"#.to_vec())
            .expect("request");
        sign_request(&mut request, KEY_ID, private_key).expect("signed");
        request
    }

    /// Re-target a signed request the way a server sees it: origin-form URI.
    fn as_received(request: Request<Vec<u8>>) -> Request<Vec<u8>> {
        let (mut parts, body) = request.into_parts();
        parts.uri = parts
            .uri
            .path_and_query()
            .expect("path")
            .as_str()
            .parse()
            .expect("origin-form uri");
        Request::from_parts(parts, body)
    }

    #[tokio::test]
    async fn signed_post_round_trips() {
        let (private_key, public_key) = generate_test_keypair();
        let request = as_received(signed_post(&private_key));

        let key_id = verify_request(&request, &resolver_for(public_key))
            .await
            .expect("valid signature should verify");
        assert_eq!(key_id, KEY_ID);
    }

    #[tokio::test]
    async fn signed_get_covers_host_date_accept() {
        let (private_key, public_key) = generate_test_keypair();
        let mut request = Request::get("https://remote.example/notes/1")
            .body(Vec::new())
            .expect("request");
        sign_request(&mut request, KEY_ID, &private_key).expect("signed");

        assert_eq!(request.headers()[header::HOST], "remote.example");
        assert_eq!(request.headers()[header::ACCEPT], ACTIVITY_ACCEPT);
        assert!(request.headers().get("digest").is_none());

        let parsed = parse_signature_header(
            request.headers()["signature"].to_str().expect("ascii"),
        )
        .expect("parsed");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date", "accept"]);

        verify_request(&request, &resolver_for(public_key))
            .await
            .expect("GET signature should verify");
    }

    #[tokio::test]
    async fn post_signs_request_target_date_digest() {
        let (private_key, _) = generate_test_keypair();
        let request = signed_post(&private_key);

        let parsed = parse_signature_header(
            request.headers()["signature"].to_str().expect("ascii"),
        )
        .expect("parsed");
        assert_eq!(parsed.headers, vec!["(request-target)", "date", "digest"]);
        assert_eq!(parsed.algorithm, "rsa-sha256");
        assert_eq!(
            request.headers()["digest"],
            generate_digest(br#"{"type":"Follow"}"#).as_str()
        );
    }

    #[tokio::test]
    async fn tampered_date_fails() {
        let (private_key, public_key) = generate_test_keypair();
        let mut request = as_received(signed_post(&private_key));
        let shifted = (Utc::now() - chrono::Duration::seconds(5))
            .format(HTTP_DATE_FORMAT)
            .to_string();
        request
            .headers_mut()
            .insert(header::DATE, HeaderValue::from_str(&shifted).expect("date"));

        let result = verify_request(&request, &resolver_for(public_key)).await;
        assert!(matches!(result, Err(AppError::Signature(_))));
    }

    #[tokio::test]
    async fn tampered_body_fails_digest() {
        let (private_key, public_key) = generate_test_keypair();
        let request = as_received(signed_post(&private_key));
        let (parts, _) = request.into_parts();
        let request = Request::from_parts(parts, br#"{"type":"Block"}"#.to_vec());

        match verify_request(&request, &resolver_for(public_key)).await {
            Err(AppError::Signature(msg)) => assert!(msg.contains("Digest mismatch")),
            other => panic!("expected digest mismatch, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tampered_path_fails() {
        let (private_key, public_key) = generate_test_keypair();
        let request = as_received(signed_post(&private_key));
        let (mut parts, body) = request.into_parts();
        parts.uri = "/users/mallory/inbox?foo=bar".parse().expect("uri");
        let request = Request::from_parts(parts, body);

        match verify_request(&request, &resolver_for(public_key)).await {
            Err(AppError::Signature(msg)) => assert!(msg.contains("verification failed")),
            other => panic!("expected verification failure, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_key_fails() {
        let (private_key, _) = generate_test_keypair();
        let (_, other_public) = generate_test_keypair();
        let request = as_received(signed_post(&private_key));

        let result = verify_request(&request, &resolver_for(other_public)).await;
        assert!(matches!(result, Err(AppError::Signature(_))));
    }

    #[tokio::test]
    async fn missing_signature_header_fails() {
        let request = Request::post("/inbox").body(Vec::new()).expect("request");
        let resolver = MockKeyResolver::new();

        match verify_request(&request, &resolver).await {
            Err(AppError::Signature(msg)) => assert!(msg.contains("Missing Signature header")),
            other => panic!("expected missing signature error, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_algorithm_fails() {
        let (private_key, public_key) = generate_test_keypair();
        let mut request = as_received(signed_post(&private_key));
        let header = request.headers()["signature"]
            .to_str()
            .expect("ascii")
            .replace("rsa-sha256", "ed25519");
        request
            .headers_mut()
            .insert("signature", HeaderValue::from_str(&header).expect("header"));

        match verify_request(&request, &resolver_for(public_key)).await {
            Err(AppError::Signature(msg)) => assert!(msg.contains("Unsupported")),
            other => panic!("expected unsupported algorithm, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolvable_key_fails_as_signature_error() {
        let (private_key, _) = generate_test_keypair();
        let request = as_received(signed_post(&private_key));
        let mut resolver = MockKeyResolver::new();
        resolver
            .expect_public_key()
            .returning(|_| Err(AppError::NotFound));

        let result = verify_request(&request, &resolver).await;
        assert!(matches!(result, Err(AppError::Signature(_))));
    }

    #[test]
    fn parse_signature_header_accepts_hs2019_and_spacing() {
        let parsed = parse_signature_header(
            r#"keyId="https://remote.example/actor#key", algorithm="hs2019", headers="(request-target) Host Date", signature="YWJj""#,
        )
        .expect("parsed");
        assert_eq!(parsed.key_id, "https://remote.example/actor#key");
        assert_eq!(parsed.algorithm, "hs2019");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
        assert_eq!(parsed.signature, "YWJj");
    }

    #[test]
    fn parse_signature_header_requires_key_id() {
        let result = parse_signature_header(r#"algorithm="rsa-sha256",signature="YWJj""#);
        assert!(matches!(result, Err(AppError::Signature(_))));
    }

    #[test]
    fn digest_matches_among_multiple_algorithms() {
        let body = b"hello";
        let header = format!("SHA-512=abc,{}", generate_digest(body).replace("SHA-256", "sha-256"));
        assert!(digest_matches(&header, body));
        assert!(!digest_matches("SHA-256=bm9wZQ==", body));
    }

    #[test]
    fn public_keys_parse_in_both_encodings() {
        let (_, public_key) = generate_test_keypair();
        let spki = public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("spki pem");
        let pkcs1 = public_key.to_pkcs1_pem(LineEnding::LF).expect("pkcs1 pem");

        assert_eq!(parse_public_key_pem(&spki).expect("spki"), public_key);
        assert_eq!(parse_public_key_pem(&pkcs1).expect("pkcs1"), public_key);
    }

    #[test]
    fn key_id_matches_actor_accepts_same_actor() {
        assert!(key_id_matches_actor(
            "https://remote.example/users/alice#main-key",
            "https://remote.example/users/alice",
        ));
    }

    #[test]
    fn key_id_matches_actor_rejects_different_actor() {
        assert!(!key_id_matches_actor(
            "https://remote.example/users/bob#main-key",
            "https://remote.example/users/alice",
        ));
    }
}
