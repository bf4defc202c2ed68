/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_sig::{sign_request_rsa_sha256, ACCEPT_ACTIVITY};
use crate::store::Actor;
use anyhow::{anyhow, Context, Result};
use apfed_protocol::{CollectionSynchronization, COLLECTION_SYNCHRONIZATION_HEADER};
use http::{HeaderMap, HeaderValue, Method, Uri};
use std::sync::Arc;

pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Identity a request is signed as.
#[derive(Clone)]
pub struct SigningActor {
    pub key_id: String,
    pub private_key_pem: String,
}

impl SigningActor {
    /// None for actors we hold no private key for.
    pub fn for_actor(actor: &Actor) -> Option<Self> {
        let pem = actor.private_key_pem.as_deref()?.trim();
        if pem.is_empty() {
            return None;
        }
        Some(Self {
            key_id: actor.key_id(),
            private_key_pem: pem.to_string(),
        })
    }
}

pub trait RequestSigner: Send + Sync {
    /// Adds `Signature` (and any missing `Date`/`Digest`/`Host`) to `headers`.
    fn sign(
        &self,
        actor: &SigningActor,
        method: &Method,
        uri: &Uri,
        headers: &mut HeaderMap,
        body: &[u8],
        signed_headers: &[&str],
    ) -> Result<()>;
}

/// draft-cavage `rsa-sha256`.
pub struct RsaSha256Signer;

impl RequestSigner for RsaSha256Signer {
    fn sign(
        &self,
        actor: &SigningActor,
        method: &Method,
        uri: &Uri,
        headers: &mut HeaderMap,
        body: &[u8],
        signed_headers: &[&str],
    ) -> Result<()> {
        sign_request_rsa_sha256(&actor.private_key_pem, &actor.key_id, method, uri, headers, body, signed_headers)
    }
}

#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl SignedRequest {
    /// Rebuildable, so retries reuse the same signature.
    pub fn to_reqwest(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut rb = client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone());
        if !self.body.is_empty() {
            rb = rb.body(self.body.clone());
        }
        rb
    }
}

#[derive(Clone)]
pub struct SignedRequestBuilder {
    signer: Arc<dyn RequestSigner>,
}

fn parse_target(url: &str) -> Result<Uri> {
    let uri: Uri = url.trim().parse().with_context(|| format!("bad url: {url}"))?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.authority().is_some() => Ok(uri),
        _ => Err(anyhow!("not an absolute http(s) url: {url}")),
    }
}

impl SignedRequestBuilder {
    pub fn new(signer: Arc<dyn RequestSigner>) -> Self {
        Self { signer }
    }

    pub fn post(
        &self,
        actor: &SigningActor,
        inbox_url: &str,
        body: &[u8],
        sync: Option<&CollectionSynchronization>,
    ) -> Result<SignedRequest> {
        let uri = parse_target(inbox_url)?;
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static(ACTIVITY_JSON));
        let mut signed = vec!["(request-target)", "host", "date", "digest", "content-type"];
        if let Some(sync) = sync {
            headers.insert(
                COLLECTION_SYNCHRONIZATION_HEADER,
                sync.to_header_value().parse().context("set Collection-Synchronization")?,
            );
            signed.push("collection-synchronization");
        }
        self.signer
            .sign(actor, &Method::POST, &uri, &mut headers, body, &signed)?;
        Ok(SignedRequest {
            method: Method::POST,
            url: inbox_url.trim().to_string(),
            headers,
            body: body.to_vec(),
        })
    }

    pub fn get(&self, actor: &SigningActor, url: &str) -> Result<SignedRequest> {
        let uri = parse_target(url)?;
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static(ACCEPT_ACTIVITY));
        self.signer.sign(
            actor,
            &Method::GET,
            &uri,
            &mut headers,
            &[],
            &["(request-target)", "host", "date", "accept"],
        )?;
        Ok(SignedRequest {
            method: Method::GET,
            url: url.trim().to_string(),
            headers,
            body: Vec::new(),
        })
    }
}
