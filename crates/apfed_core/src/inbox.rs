/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Synchronous part of inbox handling. Everything past signature
//! verification is queued.

use crate::failure_tracker::DeliveryHealth;
use crate::followers_sync::{needs_synchronization, parse_header};
use crate::http_sig::{RequestVerifier, VerifyError};
use crate::ingest::string_or_id;
use crate::job_queue::{job_args, JobQueue};
use crate::metrics::FederationMetrics;
use crate::store::{Actor, FederationStore, Protocol};
use anyhow::Result;
use apfed_protocol::{JobKind, ProcessInboundArgs, ResolveActorArgs, COLLECTION_SYNCHRONIZATION_HEADER};
use http::{HeaderMap, Method, Uri};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    TooLarge,
    /// Unknown actor announcing its own deletion or update. Acknowledged and ignored.
    Ghost,
    Rejected(String),
    Accepted(Actor),
}

/// A `Delete` or `Update` of the actor itself, from an actor we never met.
/// Bodies that do not parse are never ghosts.
pub fn is_ghost_activity(store: &dyn FederationStore, body: &[u8]) -> Result<bool> {
    let Ok(v) = serde_json::from_slice::<Value>(body) else {
        return Ok(false);
    };
    let ty = v.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if !matches!(ty, "Delete" | "Update") {
        return Ok(false);
    }
    let Some(actor) = v.get("actor").and_then(string_or_id) else {
        return Ok(false);
    };
    if v.get("object").and_then(string_or_id).as_deref() != Some(actor.as_str()) {
        return Ok(false);
    }
    Ok(store.actor_by_uri(&actor)?.is_none())
}

pub struct InboxGate {
    store: Arc<dyn FederationStore>,
    verifier: Arc<dyn RequestVerifier>,
    queue: Arc<dyn JobQueue>,
    health: Arc<dyn DeliveryHealth>,
    metrics: Arc<FederationMetrics>,
    max_body_bytes: usize,
}

impl InboxGate {
    pub fn new(
        store: Arc<dyn FederationStore>,
        verifier: Arc<dyn RequestVerifier>,
        queue: Arc<dyn JobQueue>,
        health: Arc<dyn DeliveryHealth>,
        metrics: Arc<FederationMetrics>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            store,
            verifier,
            queue,
            health,
            metrics,
            max_body_bytes,
        }
    }

    pub async fn receive(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &[u8],
        recipient_actor_id: Option<i64>,
    ) -> Result<GateDecision> {
        if body.len() > self.max_body_bytes {
            FederationMetrics::incr(&self.metrics.inbox_rejected);
            return Ok(GateDecision::TooLarge);
        }
        if is_ghost_activity(self.store.as_ref(), body)? {
            FederationMetrics::incr(&self.metrics.inbox_ghosts);
            debug!("ignoring self-delete/update from unknown actor");
            return Ok(GateDecision::Ghost);
        }

        let sender = match self.verifier.verify(method, uri, headers, body).await {
            Ok(a) => a,
            Err(VerifyError::Rejected(reason)) => {
                FederationMetrics::incr(&self.metrics.inbox_rejected);
                debug!("inbox rejected: {reason}");
                return Ok(GateDecision::Rejected(reason));
            }
            Err(VerifyError::Internal(e)) => return Err(e),
        };

        self.on_contact(&sender).await?;
        self.check_synchronization(&sender, headers).await;

        let args = ProcessInboundArgs {
            sender_uri: sender.uri.clone(),
            body: String::from_utf8_lossy(body).into_owned(),
            recipient_actor_id,
        };
        self.queue.enqueue(JobKind::ProcessInbound, job_args(&args)?).await?;
        FederationMetrics::incr(&self.metrics.inbox_accepted);
        Ok(GateDecision::Accepted(sender))
    }

    /// The sender reached us: its inbox is reachable again, and accounts we
    /// only know through the legacy protocol get re-resolved.
    async fn on_contact(&self, sender: &Actor) -> Result<()> {
        self.health.reset(sender.preferred_inbox_url());
        if sender.preferred_inbox_url() != sender.inbox_url {
            self.health.reset(&sender.inbox_url);
        }
        if sender.protocol == Protocol::Legacy || sender.stale {
            self.store.mark_actor_stale(sender.id)?;
            self.queue
                .enqueue(JobKind::ResolveActor, job_args(&ResolveActorArgs { uri: sender.uri.clone() })?)
                .await?;
        }
        Ok(())
    }

    async fn check_synchronization(&self, sender: &Actor, headers: &HeaderMap) {
        let Some(raw) = headers
            .get(COLLECTION_SYNCHRONIZATION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let Some(header) = parse_header(raw) else {
            debug!("unparsable {COLLECTION_SYNCHRONIZATION_HEADER} from {}", sender.uri);
            return;
        };
        let result = async {
            if let Some(args) = needs_synchronization(self.store.as_ref(), sender, &header)? {
                self.queue
                    .enqueue(JobKind::SynchronizeFollowers, job_args(&args)?)
                    .await?;
            }
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!("followers synchronization check for {} failed: {e:#}", sender.uri);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::failure_tracker::FailureTracker;
    use crate::followers_sync::{followers_digest, synchronization_url};
    use crate::job_queue::tests::temp_queue;
    use crate::job_queue::SqliteJobQueue;
    use crate::store::tests::{local, remote, temp_store};
    use crate::store::{NewActor, SqliteStore};
    use apfed_protocol::CollectionSynchronization;
    use async_trait::async_trait;
    use serde_json::json;

    /// Accepts every request as coming from `actor`, or rejects all of them.
    pub(crate) struct FixedVerifier {
        pub actor: Option<Actor>,
    }

    #[async_trait]
    impl RequestVerifier for FixedVerifier {
        async fn verify(&self, _m: &Method, _u: &Uri, _h: &HeaderMap, _b: &[u8]) -> Result<Actor, VerifyError> {
            self.actor
                .clone()
                .ok_or_else(|| VerifyError::Rejected("signature invalid".into()))
        }
    }

    struct Fixture {
        _sdir: tempfile::TempDir,
        _qdir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        queue: Arc<SqliteJobQueue>,
        tracker: Arc<FailureTracker>,
    }

    impl Fixture {
        fn new() -> Self {
            let (sdir, store) = temp_store();
            let (qdir, queue) = temp_queue();
            Self {
                _sdir: sdir,
                _qdir: qdir,
                store: Arc::new(store),
                queue: Arc::new(queue),
                tracker: Arc::new(FailureTracker::new(1)),
            }
        }

        fn gate(&self, sender: Option<Actor>) -> InboxGate {
            InboxGate::new(
                self.store.clone(),
                Arc::new(FixedVerifier { actor: sender }),
                self.queue.clone(),
                self.tracker.clone(),
                Arc::new(FederationMetrics::new()),
                1024,
            )
        }
    }

    async fn post(gate: &InboxGate, headers: HeaderMap, body: &Value) -> GateDecision {
        let uri: Uri = "/inbox".parse().unwrap();
        gate.receive(&Method::POST, &uri, &headers, body.to_string().as_bytes(), None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_self_delete_is_a_ghost() {
        let f = Fixture::new();
        let gate = f.gate(None);
        let body = json!({"type": "Delete", "actor": "https://gone.example/users/x", "object": "https://gone.example/users/x"});
        assert_eq!(post(&gate, HeaderMap::new(), &body).await, GateDecision::Ghost);
        assert!(f.queue.pending_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_actor_delete_is_verified() {
        let f = Fixture::new();
        let bob = remote(&f.store, "r.example", "bob", true);
        let gate = f.gate(None);
        let body = json!({"type": "Delete", "actor": bob.uri, "object": {"id": bob.uri}});
        assert!(matches!(post(&gate, HeaderMap::new(), &body).await, GateDecision::Rejected(_)));
        assert!(f.queue.pending_jobs(None).await.unwrap().is_empty());
    }

    #[test]
    fn unparsable_bodies_are_not_ghosts() {
        let (_dir, store) = temp_store();
        assert!(!is_ghost_activity(&store, b"{oops").unwrap());
        let note_delete = json!({"type": "Delete", "actor": "https://x.example/u", "object": "https://x.example/n/1"});
        assert!(!is_ghost_activity(&store, note_delete.to_string().as_bytes()).unwrap());
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let f = Fixture::new();
        let gate = f.gate(None);
        let body = json!({"type": "Create", "content": "x".repeat(2048)});
        assert_eq!(post(&gate, HeaderMap::new(), &body).await, GateDecision::TooLarge);
    }

    #[tokio::test]
    async fn accepted_activity_is_queued_and_resets_health() {
        let f = Fixture::new();
        let bob = remote(&f.store, "r.example", "bob", true);
        f.tracker.track_failure("https://r.example/inbox");
        assert!(!f.tracker.available("https://r.example/inbox"));

        let gate = f.gate(Some(bob.clone()));
        let body = json!({"id": "https://r.example/a/1", "type": "Like", "actor": bob.uri, "object": "x"});
        assert_eq!(post(&gate, HeaderMap::new(), &body).await, GateDecision::Accepted(bob.clone()));
        assert!(f.tracker.available("https://r.example/inbox"));

        let jobs = f.queue.pending_jobs(Some(JobKind::ProcessInbound)).await.unwrap();
        let args: ProcessInboundArgs = jobs[0].args().unwrap();
        assert_eq!(args.sender_uri, bob.uri);
        assert!(f.queue.pending_jobs(Some(JobKind::ResolveActor)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_sender_is_upgraded_on_contact() {
        let f = Fixture::new();
        let old = f
            .store
            .upsert_actor(&NewActor {
                uri: "https://old.example/users/o".into(),
                username: "o".into(),
                inbox_url: "https://old.example/users/o/inbox".into(),
                legacy: true,
                ..Default::default()
            })
            .unwrap();
        let gate = f.gate(Some(old.clone()));
        post(&gate, HeaderMap::new(), &json!({"type": "Like", "actor": old.uri})).await;
        let jobs = f.queue.pending_jobs(Some(JobKind::ResolveActor)).await.unwrap();
        let args: ResolveActorArgs = jobs[0].args().unwrap();
        assert_eq!(args.uri, old.uri);
        assert!(f.store.actor(old.id).unwrap().unwrap().stale);
    }

    #[tokio::test]
    async fn digest_mismatch_schedules_synchronization() {
        let f = Fixture::new();
        let me = local(&f.store, "me");
        let bob = remote(&f.store, "r.example", "bob", true);
        f.store.add_follow(me.id, bob.id).unwrap();
        let gate = f.gate(Some(bob.clone()));

        let mut header = CollectionSynchronization {
            collection_id: bob.followers_url.clone().unwrap(),
            digest: followers_digest([me.uri.as_str()]),
            url: synchronization_url(&bob.uri),
        };
        let mut headers = HeaderMap::new();
        headers.insert(COLLECTION_SYNCHRONIZATION_HEADER, header.to_header_value().parse().unwrap());
        post(&gate, headers, &json!({"type": "Like"})).await;
        assert!(f.queue.pending_jobs(Some(JobKind::SynchronizeFollowers)).await.unwrap().is_empty());

        header.digest = followers_digest(Vec::<String>::new());
        let mut headers = HeaderMap::new();
        headers.insert(COLLECTION_SYNCHRONIZATION_HEADER, header.to_header_value().parse().unwrap());
        post(&gate, headers, &json!({"type": "Like"})).await;
        assert_eq!(f.queue.pending_jobs(Some(JobKind::SynchronizeFollowers)).await.unwrap().len(), 1);
    }
}
