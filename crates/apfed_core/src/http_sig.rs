/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::{Actor, FederationStore, NewActor};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{HeaderMap, Method, Uri};
use httpdate::parse_http_date;
use rsa::{
    pkcs1v15::{SigningKey, VerifyingKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    signature::{RandomizedSigner, SignatureEncoding, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;

pub const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

#[derive(Clone)]
pub struct KeyResolver {
    client: reqwest::Client,
    cache: Arc<RwLock<HashMap<String, CachedActor>>>,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedActor {
    summary: ActorSummary,
    expires_at: std::time::Instant,
}

impl KeyResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::from_secs(300),
        }
    }

    pub async fn resolve_actor_summary_for_key_id(&self, key_id: &str) -> Result<ActorSummary> {
        let (actor_url, wanted_key_id) = match key_id.split_once('#') {
            Some((actor, _frag)) => (actor.to_string(), Some(key_id.to_string())),
            None => (key_id.to_string(), None),
        };

        if let Some(hit) = self.get_cached(&actor_url).await {
            if wanted_key_id.as_deref().map(|k| k == hit.key_id).unwrap_or(true) {
                return Ok(hit);
            }
        }

        let summary = self.fetch_actor(&actor_url).await?;
        self.put_cached(&actor_url, summary.clone()).await;
        Ok(summary)
    }

    /// Uncached fetch of an actor document.
    pub async fn fetch_actor(&self, actor_url: &str) -> Result<ActorSummary> {
        let resp = self
            .client
            .get(actor_url)
            .header("Accept", ACCEPT_ACTIVITY)
            .send()
            .await
            .with_context(|| format!("fetch actor: {actor_url}"))?
            .error_for_status()
            .with_context(|| format!("actor not ok: {actor_url}"))?;

        let text = resp.text().await?;
        let actor: ActorDoc = serde_json::from_str(&text)
            .with_context(|| format!("parse actor json from {actor_url}"))?;

        let id = actor.id.unwrap_or_else(|| actor_url.to_string());
        if id != actor_url {
            return Err(anyhow!("actor id mismatch: fetched {actor_url}, got {id}"));
        }
        let pk = actor.public_key.ok_or_else(|| anyhow!("actor missing publicKey"))?;
        let inbox = actor.inbox.ok_or_else(|| anyhow!("actor missing inbox"))?;

        Ok(ActorSummary {
            actor_url: id,
            key_id: pk.id,
            public_key_pem: pk.public_key_pem,
            username: actor.preferred_username.unwrap_or_default(),
            inbox,
            shared_inbox: actor.endpoints.and_then(|e| e.shared_inbox),
            followers: actor.followers,
        })
    }

    pub async fn invalidate(&self, actor_url: &str) {
        self.cache.write().await.remove(actor_url);
    }

    async fn get_cached(&self, actor_url: &str) -> Option<ActorSummary> {
        let mut cache = self.cache.write().await;
        let now = std::time::Instant::now();
        if let Some(v) = cache.get(actor_url) {
            if v.expires_at > now {
                return Some(v.summary.clone());
            }
        }
        cache.remove(actor_url);
        None
    }

    async fn put_cached(&self, actor_url: &str, summary: ActorSummary) {
        let mut cache = self.cache.write().await;
        cache.insert(
            actor_url.to_string(),
            CachedActor {
                summary,
                expires_at: std::time::Instant::now() + self.ttl,
            },
        );
    }
}

#[derive(Debug, Clone)]
pub struct ActorSummary {
    pub actor_url: String,
    pub key_id: String,
    pub public_key_pem: String,
    pub username: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub followers: Option<String>,
}

impl ActorSummary {
    pub fn to_new_actor(&self) -> NewActor {
        NewActor {
            uri: self.actor_url.clone(),
            username: self.username.clone(),
            local: false,
            inbox_url: self.inbox.clone(),
            shared_inbox_url: self.shared_inbox.clone(),
            followers_url: self.followers.clone(),
            public_key_pem: Some(self.public_key_pem.clone()),
            private_key_pem: None,
            legacy: false,
        }
    }
}

#[derive(Debug)]
pub struct SignatureParams {
    pub key_id: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

/// `k1="v1", k2="v2"` parameter lists, as used by `Signature` and
/// `Collection-Synchronization`.
pub fn parse_signature_params(value: &str) -> HashMap<String, String> {
    let mut map = HashMap::<String, String>::new();
    for part in value.split(',') {
        let part = part.trim();
        let Some((k, v)) = part.split_once('=') else { continue };
        let v = v.trim().trim_matches('"');
        map.insert(k.trim().to_string(), v.to_string());
    }
    map
}

pub fn parse_signature_header(value: &str) -> Result<SignatureParams> {
    // Signature: keyId="...",headers="(request-target) host date",signature="base64..."
    let map = parse_signature_params(value);

    let key_id = map
        .get("keyId")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing keyId"))?;
    let headers = map
        .get("headers")
        .cloned()
        .unwrap_or_else(|| "date".to_string());
    let signature_b64 = map
        .get("signature")
        .cloned()
        .ok_or_else(|| anyhow!("Signature missing signature"))?;

    let signature = B64
        .decode(signature_b64.as_bytes())
        .context("decode signature")?;

    Ok(SignatureParams {
        key_id,
        headers: headers
            .split_whitespace()
            .map(|s| s.to_ascii_lowercase())
            .collect(),
        signature,
    })
}

pub fn build_signing_string(method: &Method, uri: &Uri, headers: &HeaderMap, signed_headers: &[String]) -> Result<String> {
    let mut out = String::new();
    for (i, name) in signed_headers.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if name == "(request-target)" {
            let path = uri.path();
            let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
            out.push_str("(request-target): ");
            out.push_str(&method.as_str().to_ascii_lowercase());
            out.push(' ');
            out.push_str(path);
            out.push_str(&query);
            continue;
        }

        let header_name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("bad signed header name: {name}"))?;
        let value = headers
            .get(&header_name)
            .ok_or_else(|| anyhow!("missing signed header: {name}"))?
            .to_str()
            .with_context(|| format!("invalid header value for {name}"))?;
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value.trim());
    }
    Ok(out)
}

pub fn digest_header_value(body: &[u8]) -> String {
    format!("SHA-256={}", B64.encode(Sha256::digest(body)))
}

pub fn verify_digest(headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let digest = headers
        .get("Digest")
        .ok_or_else(|| anyhow!("missing Digest header"))?
        .to_str()
        .context("Digest header not utf8")?;
    // Digest: SHA-256=base64
    let Some((alg, value)) = digest.split_once('=') else {
        return Err(anyhow!("invalid Digest header"));
    };
    if alg.trim().eq_ignore_ascii_case("SHA-256") {
        let expected = B64.decode(value.trim().as_bytes()).context("decode digest")?;
        let actual = Sha256::digest(body);
        if expected.as_slice() != actual.as_slice() {
            return Err(anyhow!("digest mismatch"));
        }
        return Ok(());
    }
    Err(anyhow!("unsupported digest alg: {alg}"))
}

pub fn verify_date(headers: &HeaderMap, max_skew: Duration) -> Result<()> {
    let date = headers
        .get("Date")
        .ok_or_else(|| anyhow!("missing Date header"))?
        .to_str()
        .context("Date header not utf8")?;
    let ts = parse_http_date(date).context("parse Date header")?;
    let now = std::time::SystemTime::now();
    let diff = if now > ts {
        now.duration_since(ts).unwrap_or_default()
    } else {
        ts.duration_since(now).unwrap_or_default()
    };
    if diff > max_skew {
        return Err(anyhow!("Date skew too large: {}s", diff.as_secs()));
    }
    Ok(())
}

pub fn verify_signature_rsa_sha256(public_key_pem: &str, signing_string: &str, signature: &[u8]) -> Result<()> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .context("parse public key pem")?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let sig = rsa::pkcs1v15::Signature::try_from(signature)
        .context("invalid rsa signature bytes")?;
    verifying_key
        .verify(signing_string.as_bytes(), &sig)
        .context("signature verify failed")?;
    Ok(())
}

pub fn sign_request_rsa_sha256(
    private_key_pem: &str,
    key_id: &str,
    method: &Method,
    uri: &Uri,
    headers: &mut HeaderMap,
    body: &[u8],
    signed_headers: &[&str],
) -> Result<()> {
    if !headers.contains_key("Date") {
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        headers.insert("Date", date.parse().context("set Date")?);
    }

    let signed_headers_lower: Vec<String> = signed_headers.iter().map(|s| s.to_ascii_lowercase()).collect();
    let want_digest = signed_headers_lower.iter().any(|h| h == "digest") || !body.is_empty();
    if want_digest && !headers.contains_key("Digest") {
        headers.insert("Digest", digest_header_value(body).parse().context("set Digest")?);
    }

    if !headers.contains_key("Host") {
        if let Some(auth) = uri.authority() {
            headers.insert("Host", auth.as_str().parse().context("set Host")?);
        }
    }

    let signing_string = build_signing_string(method, uri, headers, &signed_headers_lower)?;

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .context("parse private key pem")?;
    let signing_key = SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::rngs::OsRng;
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let sig_b64 = B64.encode(signature.to_bytes());

    let headers_list = signed_headers_lower.join(" ");
    let sig_header = format!(
        "keyId=\"{key_id}\",algorithm=\"rsa-sha256\",headers=\"{headers_list}\",signature=\"{sig_b64}\""
    );
    headers.insert("Signature", sig_header.parse().context("set Signature")?);
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Answered with 401 and this reason.
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn rejected(e: anyhow::Error) -> VerifyError {
    VerifyError::Rejected(format!("{e:#}"))
}

#[async_trait]
pub trait RequestVerifier: Send + Sync {
    /// The actor whose key produced the request signature.
    async fn verify(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Result<Actor, VerifyError>;
}

/// Draft-cavage verification. Keys come from the store when known, otherwise
/// from the actor document, which is then recorded.
pub struct HttpSignatureVerifier {
    store: Arc<dyn FederationStore>,
    resolver: KeyResolver,
    max_skew: Duration,
}

impl HttpSignatureVerifier {
    pub fn new(store: Arc<dyn FederationStore>, resolver: KeyResolver, max_skew: Duration) -> Self {
        Self {
            store,
            resolver,
            max_skew,
        }
    }

    async fn refresh_actor(&self, key_id: &str) -> Result<Actor, VerifyError> {
        let summary = self
            .resolver
            .resolve_actor_summary_for_key_id(key_id)
            .await
            .map_err(|e| VerifyError::Rejected(format!("unable to fetch key {key_id}: {e:#}")))?;
        Ok(self.store.upsert_actor(&summary.to_new_actor())?)
    }
}

#[async_trait]
impl RequestVerifier for HttpSignatureVerifier {
    async fn verify(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> Result<Actor, VerifyError> {
        let raw = headers
            .get("Signature")
            .ok_or_else(|| VerifyError::Rejected("request not signed".to_string()))?
            .to_str()
            .map_err(|_| VerifyError::Rejected("Signature header not utf8".to_string()))?;
        let params = parse_signature_header(raw).map_err(rejected)?;

        if !params.headers.iter().any(|h| h == "(request-target)") {
            return Err(VerifyError::Rejected("(request-target) not signed".to_string()));
        }
        if params.headers.iter().any(|h| h == "date") || headers.contains_key("Date") {
            verify_date(headers, self.max_skew).map_err(rejected)?;
        }
        if *method == Method::POST {
            if !params.headers.iter().any(|h| h == "digest") {
                return Err(VerifyError::Rejected("digest not signed".to_string()));
            }
            verify_digest(headers, body).map_err(rejected)?;
        }

        let signing_string = build_signing_string(method, uri, headers, &params.headers).map_err(rejected)?;
        let actor_uri = params
            .key_id
            .split_once('#')
            .map(|(a, _)| a)
            .unwrap_or(&params.key_id);

        let known = self.store.actor_by_uri(actor_uri)?;
        if let Some(actor) = known.filter(|a| !a.local && !a.stale) {
            if let Some(pem) = actor.public_key_pem.as_deref() {
                if verify_signature_rsa_sha256(pem, &signing_string, &params.signature).is_ok() {
                    return Ok(actor);
                }
                // Possibly a rotated key; fall through to a fresh fetch.
                debug!("stored key failed for {actor_uri}, refetching");
                self.resolver.invalidate(actor_uri).await;
            }
        }

        let actor = self.refresh_actor(&params.key_id).await?;
        let pem = actor
            .public_key_pem
            .as_deref()
            .ok_or_else(|| VerifyError::Rejected("actor has no public key".to_string()))?;
        verify_signature_rsa_sha256(pem, &signing_string, &params.signature).map_err(rejected)?;
        Ok(actor)
    }
}

#[derive(Debug, Deserialize)]
struct ActorDoc {
    id: Option<String>,
    #[serde(rename = "preferredUsername")]
    preferred_username: Option<String>,
    inbox: Option<String>,
    followers: Option<String>,
    #[serde(rename = "publicKey")]
    public_key: Option<ActorPublicKey>,
    endpoints: Option<ActorEndpoints>,
}

#[derive(Debug, Deserialize)]
struct ActorPublicKey {
    id: String,
    #[serde(rename = "publicKeyPem")]
    public_key_pem: String,
}

#[derive(Debug, Deserialize)]
struct ActorEndpoints {
    #[serde(rename = "sharedInbox")]
    shared_inbox: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_identity;
    use crate::store::tests::temp_store;
    use http::HeaderValue;

    #[test]
    fn params_parse_keeps_base64_padding() {
        let p = parse_signature_params(r#"keyId="https://a.example/u#main-key", signature="YWJj==""#);
        assert_eq!(p["keyId"], "https://a.example/u#main-key");
        assert_eq!(p["signature"], "YWJj==");
    }

    #[test]
    fn sign_then_verify_signing_string() {
        let kp = test_identity();
        let method = Method::POST;
        let uri: Uri = "https://r.example/inbox".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/activity+json"));
        let body = br#"{"type":"Create"}"#;
        sign_request_rsa_sha256(
            &kp.private_key_pem,
            "https://l.example/users/a#main-key",
            &method,
            &uri,
            &mut headers,
            body,
            &["(request-target)", "host", "date", "digest", "content-type"],
        )
        .unwrap();
        verify_digest(&headers, body).unwrap();
        assert!(verify_digest(&headers, b"tampered").is_err());

        let params = parse_signature_header(headers["Signature"].to_str().unwrap()).unwrap();
        assert_eq!(params.headers[0], "(request-target)");
        let s = build_signing_string(&method, &uri, &headers, &params.headers).unwrap();
        assert!(s.starts_with("(request-target): post /inbox\nhost: r.example\n"));
        verify_signature_rsa_sha256(&kp.public_key_pem, &s, &params.signature).unwrap();
    }

    #[test]
    fn stale_date_is_rejected() {
        let mut headers = HeaderMap::new();
        let old = std::time::SystemTime::now() - Duration::from_secs(7200);
        headers.insert("Date", httpdate::fmt_http_date(old).parse().unwrap());
        assert!(verify_date(&headers, Duration::from_secs(3600)).is_err());
        assert!(verify_date(&headers, Duration::from_secs(86_400)).is_ok());
    }

    #[tokio::test]
    async fn verifier_uses_stored_key() {
        let (_dir, store) = temp_store();
        let kp = test_identity();
        let actor = store
            .upsert_actor(&NewActor {
                uri: "https://r.example/users/bob".into(),
                username: "bob".into(),
                inbox_url: "https://r.example/users/bob/inbox".into(),
                public_key_pem: Some(kp.public_key_pem.clone()),
                ..Default::default()
            })
            .unwrap();
        let store: Arc<dyn FederationStore> = Arc::new(store);
        let verifier = HttpSignatureVerifier::new(
            store,
            KeyResolver::new(reqwest::Client::new()),
            Duration::from_secs(3600),
        );

        let uri: Uri = "https://l.example/inbox".parse().unwrap();
        let body = br#"{"type":"Follow"}"#;
        let mut headers = HeaderMap::new();
        sign_request_rsa_sha256(
            &kp.private_key_pem,
            &actor.key_id(),
            &Method::POST,
            &uri,
            &mut headers,
            body,
            &["(request-target)", "host", "date", "digest"],
        )
        .unwrap();

        let got = verifier.verify(&Method::POST, &uri, &headers, body).await.unwrap();
        assert_eq!(got.id, actor.id);

        let err = verifier
            .verify(&Method::POST, &uri, &headers, b"other body")
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Rejected(_)));

        let err = verifier
            .verify(&Method::POST, &uri, &HeaderMap::new(), body)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "request not signed");
    }
}
