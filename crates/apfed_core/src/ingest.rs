/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Queued processing of verified inbound activities.

use crate::job_queue::{job_args, JobError, JobQueue};
use crate::metrics::FederationMetrics;
use crate::object_fetch::ObjectFetcher;
use crate::store::{Actor, FederationStore, InteractionKind, NewActor, NewStatus, Status, Visibility};
use anyhow::{anyhow, Result};
use apfed_protocol::{
    CrawlRepliesArgs, DistributeArgs, DistributionEvent, JobKind, ProcessInboundArgs, ResolveThreadArgs,
};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Work an activity leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    /// A reply whose parent we do not have.
    ResolveThread(String),
    CrawlReplies(String),
    /// A reply to a local status, to be passed on to the local author's followers.
    Forward { status_id: i64 },
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(&self, sender: &Actor, activity: &Value, raw: &[u8]) -> Result<Vec<Followup>>;
}

/// The activity id, or a hash of the canonical JSON when it has none.
pub fn activity_dedup_id(activity: &Value) -> String {
    if let Some(id) = activity.get("id").and_then(|v| v.as_str()) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }
    let bytes = serde_json::to_vec(&canonicalize_json(activity)).unwrap_or_else(|_| b"null".to_vec());
    format!("urn:apfed:inbox:{}", hex::encode(Sha256::digest(&bytes)))
}

fn canonicalize_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys = map.keys().cloned().collect::<Vec<_>>();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                if let Some(val) = map.get(&k) {
                    out.insert(k, canonicalize_json(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

/// A string reference or an embedded object's `id`.
pub fn string_or_id(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("id")?.as_str()?,
        _ => return None,
    };
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

pub fn extract_object_id(activity: &Value) -> Option<String> {
    match activity.get("object")? {
        Value::Array(arr) => arr.iter().find_map(string_or_id),
        other => string_or_id(other),
    }
}

fn addressed(note: &Value, field: &str) -> Vec<String> {
    match note.get(field) {
        Some(Value::Array(arr)) => arr.iter().filter_map(string_or_id).collect(),
        Some(v) => string_or_id(v).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Mastodon-style visibility from `to`/`cc`.
pub fn note_visibility(note: &Value, author_followers_url: Option<&str>) -> Visibility {
    let is_public = |s: &String| s == PUBLIC_COLLECTION || s == "as:Public" || s == "Public";
    let to = addressed(note, "to");
    let cc = addressed(note, "cc");
    if to.iter().any(is_public) {
        Visibility::Public
    } else if cc.iter().any(is_public) {
        Visibility::Unlisted
    } else if author_followers_url.is_some_and(|f| to.iter().chain(cc.iter()).any(|s| s == f)) {
        Visibility::Private
    } else {
        Visibility::Direct
    }
}

/// Fields of a remote actor document we keep.
pub fn actor_from_document(doc: &Value) -> Option<NewActor> {
    let s = |k: &str| doc.get(k).and_then(|v| v.as_str()).map(str::trim).filter(|v| !v.is_empty());
    let uri = s("id")?.to_string();
    let inbox_url = s("inbox")?.to_string();
    Some(NewActor {
        username: s("preferredUsername").unwrap_or_default().to_string(),
        inbox_url,
        shared_inbox_url: doc
            .get("endpoints")
            .and_then(|e| e.get("sharedInbox"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        followers_url: s("followers").map(str::to_string),
        public_key_pem: doc
            .get("publicKey")
            .and_then(|k| k.get("publicKeyPem"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        uri,
        ..Default::default()
    })
}

/// Fetches and records a remote actor. Also clears legacy and stale markers.
pub async fn resolve_remote_actor(
    store: &dyn FederationStore,
    fetcher: &dyn ObjectFetcher,
    uri: &str,
) -> Result<Option<Actor>> {
    let Some(doc) = fetcher.fetch(uri).await? else {
        return Ok(None);
    };
    let new = actor_from_document(&doc).ok_or_else(|| anyhow!("not an actor document: {uri}"))?;
    Ok(Some(store.upsert_actor(&new)?))
}

/// Known author of a note, or the freshly resolved one.
pub async fn note_author(
    store: &dyn FederationStore,
    fetcher: &dyn ObjectFetcher,
    note: &Value,
) -> Result<Option<Actor>> {
    let Some(uri) = note.get("attributedTo").and_then(string_or_id) else {
        return Ok(None);
    };
    if let Some(a) = store.actor_by_uri(&uri)?.filter(|a| !a.stale) {
        return Ok(Some(a));
    }
    resolve_remote_actor(store, fetcher, &uri).await
}

#[derive(Debug, Clone)]
pub struct RecordedNote {
    pub status: Status,
    /// The parent, when it is already known.
    pub parent: Option<Status>,
    /// `inReplyTo` of a parent we do not have yet.
    pub unknown_parent: Option<String>,
}

/// Stores a remote Note (or Question) authored by `author`.
pub fn record_note(store: &dyn FederationStore, author: &Actor, note: &Value) -> Result<RecordedNote> {
    let uri = note
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("note without id"))?;
    let in_reply_to_uri = note.get("inReplyTo").and_then(string_or_id);
    let parent = match &in_reply_to_uri {
        Some(u) => store.status_by_uri(u)?,
        None => None,
    };

    let quote_uri = ["quote", "quoteUri", "quoteUrl", "_misskey_quote"]
        .iter()
        .find_map(|k| note.get(*k).and_then(string_or_id));
    let quoted = match &quote_uri {
        Some(u) => store.status_by_uri(u)?,
        None => None,
    };

    let mut mentions = Vec::new();
    if let Some(Value::Array(tags)) = note.get("tag") {
        for tag in tags {
            if tag.get("type").and_then(|t| t.as_str()) != Some("Mention") {
                continue;
            }
            if let Some(href) = tag.get("href").and_then(|h| h.as_str()) {
                if let Some(a) = store.actor_by_uri(href)? {
                    mentions.push(a.id);
                }
            }
        }
    }

    let status = store.insert_status(&NewStatus {
        uri: uri.to_string(),
        account_id: author.id,
        visibility: note_visibility(note, author.followers_url.as_deref()),
        in_reply_to_id: parent.as_ref().map(|p| p.id),
        in_reply_to_uri: in_reply_to_uri.clone(),
        mentions,
        quote_of_id: quoted.as_ref().map(|q| q.id),
        reblog_of_id: None,
        has_poll: note.get("type").and_then(|t| t.as_str()) == Some("Question"),
        local: false,
    })?;
    if let Some(q) = &quoted {
        store.add_interaction(q.id, author.id, InteractionKind::Quote)?;
    }

    let unknown_parent = if parent.is_none() { in_reply_to_uri } else { None };
    Ok(RecordedNote {
        status,
        parent,
        unknown_parent,
    })
}

/// Records activities in the store and applies the side effects the
/// federation layer itself depends on: follows, statuses and their
/// deletion, reblogs.
pub struct StoreActivityHandler {
    store: Arc<dyn FederationStore>,
    local_prefix: String,
}

impl StoreActivityHandler {
    pub fn new(store: Arc<dyn FederationStore>, local_base_url: &str) -> Self {
        Self {
            store,
            local_prefix: format!("{}/", local_base_url.trim_end_matches('/')),
        }
    }

    fn is_local(&self, uri: &str) -> bool {
        uri.starts_with(&self.local_prefix)
    }

    fn local_target(&self, activity: &Value) -> Result<Option<Actor>> {
        let Some(id) = extract_object_id(activity) else {
            return Ok(None);
        };
        Ok(self.store.actor_by_uri(&id)?.filter(|a| a.local))
    }

    fn handle_create(&self, sender: &Actor, object: &Value) -> Result<Vec<Followup>> {
        let ty = object.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if !matches!(ty, "Note" | "Question" | "Article" | "Page") {
            return Ok(Vec::new());
        }
        // Authors may only create their own objects.
        if object.get("attributedTo").and_then(string_or_id).as_deref() != Some(sender.uri.as_str()) {
            debug!("create from {} for foreign object", sender.uri);
            return Ok(Vec::new());
        }
        let recorded = record_note(self.store.as_ref(), sender, object)?;
        let mut out = Vec::new();
        if let Some(uri) = recorded.unknown_parent.filter(|u| !self.is_local(u)) {
            out.push(Followup::ResolveThread(uri));
        }
        if let Some(parent) = &recorded.parent {
            if parent.local && recorded.status.visibility.reaches_followers() {
                out.push(Followup::Forward { status_id: parent.id });
            }
        }
        if object.get("replies").is_some() {
            out.push(Followup::CrawlReplies(recorded.status.uri.clone()));
        }
        Ok(out)
    }
}

#[async_trait]
impl ActivityHandler for StoreActivityHandler {
    async fn handle(&self, sender: &Actor, activity: &Value, raw: &[u8]) -> Result<Vec<Followup>> {
        let ty = activity.get("type").and_then(|v| v.as_str());
        self.store
            .store_inbound_activity(&activity_dedup_id(activity), &sender.uri, ty, raw)?;

        match ty.unwrap_or("") {
            "Follow" => {
                if let Some(target) = self.local_target(activity)? {
                    self.store.add_follow(sender.id, target.id)?;
                    info!("{} now follows {}", sender.uri, target.uri);
                }
                Ok(Vec::new())
            }
            "Undo" => {
                let Some(inner) = activity.get("object").filter(|o| o.is_object()) else {
                    return Ok(Vec::new());
                };
                if inner.get("type").and_then(|t| t.as_str()) == Some("Follow") {
                    if let Some(target) = self.local_target(inner)? {
                        self.store.remove_follow(sender.id, target.id)?;
                    }
                }
                Ok(Vec::new())
            }
            "Create" => match activity.get("object") {
                Some(obj) if obj.is_object() => self.handle_create(sender, obj),
                _ => Ok(Vec::new()),
            },
            "Delete" => {
                let Some(id) = extract_object_id(activity) else {
                    return Ok(Vec::new());
                };
                match self.store.status_by_uri(&id)? {
                    Some(s) if s.account_id == sender.id => {
                        self.store.delete_status(s.id)?;
                        info!("{} deleted {id}", sender.uri);
                    }
                    Some(_) => debug!("delete of {id} by non-author {}", sender.uri),
                    None => {}
                }
                Ok(Vec::new())
            }
            "Announce" => {
                if let Some(id) = extract_object_id(activity) {
                    if let Some(s) = self.store.status_by_uri(&id)? {
                        self.store.add_interaction(s.id, sender.id, InteractionKind::Reblog)?;
                    }
                }
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed(Vec<Followup>),
    Duplicate,
}

pub struct Ingestor {
    store: Arc<dyn FederationStore>,
    handler: Arc<dyn ActivityHandler>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<FederationMetrics>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn FederationStore>,
        handler: Arc<dyn ActivityHandler>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Self {
            store,
            handler,
            queue,
            metrics,
        }
    }

    /// Runs a `process_inbound` job.
    pub async fn process(&self, args: &ProcessInboundArgs) -> Result<IngestOutcome, JobError> {
        let activity: Value = match serde_json::from_str(&args.body) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => return Err(JobError::Discard("activity is not an object".into())),
            Err(e) => {
                warn!("dropping malformed activity from {}: {e}", args.sender_uri);
                return Err(JobError::Discard(format!("invalid json: {e}")));
            }
        };
        let Some(sender) = self.store.actor_by_uri(&args.sender_uri)? else {
            return Err(JobError::Discard(format!("unknown sender {}", args.sender_uri)));
        };

        let dedup_id = activity_dedup_id(&activity);
        if !self.store.mark_activity_seen(&dedup_id)? {
            FederationMetrics::incr(&self.metrics.inbox_duplicates);
            debug!("duplicate activity {dedup_id}");
            return Ok(IngestOutcome::Duplicate);
        }

        let followups = match self.handler.handle(&sender, &activity, args.body.as_bytes()).await {
            Ok(f) => f,
            Err(e) => {
                // Let the retry see it as new.
                self.store.forget_activity(&dedup_id)?;
                return Err(JobError::Retry(e));
            }
        };

        for f in &followups {
            if let Err(e) = self.enqueue_followup(&sender, &args.body, f).await {
                // Follow-ups only come from the handler, so the retry has to run it again.
                self.store.forget_activity(&dedup_id)?;
                return Err(JobError::Retry(e));
            }
        }
        Ok(IngestOutcome::Processed(followups))
    }

    async fn enqueue_followup(&self, sender: &Actor, body: &str, followup: &Followup) -> Result<()> {
        match followup {
            Followup::ResolveThread(uri) => {
                self.queue
                    .enqueue(
                        JobKind::ResolveThread,
                        job_args(&ResolveThreadArgs {
                            uri: uri.clone(),
                            depth: 0,
                        })?,
                    )
                    .await
            }
            Followup::CrawlReplies(uri) => {
                self.queue
                    .enqueue(JobKind::CrawlReplies, job_args(&CrawlRepliesArgs { uri: uri.clone() })?)
                    .await
            }
            Followup::Forward { status_id } => {
                let Some(parent) = self.store.status(*status_id)? else {
                    return Ok(());
                };
                let mut excluded = vec![sender.inbox_url.clone()];
                if sender.preferred_inbox_url() != sender.inbox_url {
                    excluded.push(sender.preferred_inbox_url().to_string());
                }
                let args = DistributeArgs {
                    body: body.to_string(),
                    source_actor_id: parent.account_id,
                    event: DistributionEvent::Forward { status_id: parent.id },
                    excluded_inboxes: excluded,
                };
                self.queue.enqueue(JobKind::Distribute, job_args(&args)?).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_queue::tests::{temp_queue, FlakyQueue};
    use crate::job_queue::SqliteJobQueue;
    use crate::store::tests::{local, remote, temp_store};
    use crate::store::SqliteStore;
    use serde_json::json;

    struct Fixture {
        _sdir: tempfile::TempDir,
        _qdir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        queue: Arc<SqliteJobQueue>,
        ingestor: Ingestor,
    }

    fn fixture() -> Fixture {
        let (sdir, store) = temp_store();
        let (qdir, queue) = temp_queue();
        let store = Arc::new(store);
        let queue = Arc::new(queue);
        let handler = Arc::new(StoreActivityHandler::new(store.clone(), "https://local.example"));
        let ingestor = Ingestor::new(store.clone(), handler, queue.clone(), Arc::new(FederationMetrics::new()));
        Fixture {
            _sdir: sdir,
            _qdir: qdir,
            store,
            queue,
            ingestor,
        }
    }

    fn inbound(sender: &Actor, v: Value) -> ProcessInboundArgs {
        ProcessInboundArgs {
            sender_uri: sender.uri.clone(),
            body: v.to_string(),
            recipient_actor_id: None,
        }
    }

    #[test]
    fn dedup_id_ignores_key_order() {
        let a = json!({"type": "Like", "actor": "https://r.example/users/a", "object": "x"});
        let b = json!({"object": "x", "actor": "https://r.example/users/a", "type": "Like"});
        assert_eq!(activity_dedup_id(&a), activity_dedup_id(&b));
        assert_eq!(activity_dedup_id(&json!({"id": " https://r.example/1 "})), "https://r.example/1");
    }

    #[test]
    fn visibility_from_addressing() {
        let f = Some("https://r.example/users/a/followers");
        assert_eq!(note_visibility(&json!({"to": [PUBLIC_COLLECTION]}), f), Visibility::Public);
        assert_eq!(note_visibility(&json!({"to": f, "cc": ["as:Public"]}), f), Visibility::Unlisted);
        assert_eq!(note_visibility(&json!({"to": [f]}), f), Visibility::Private);
        assert_eq!(note_visibility(&json!({"to": ["https://l.example/users/b"]}), f), Visibility::Direct);
    }

    #[tokio::test]
    async fn remote_actor_is_resolved_and_upgraded() {
        let (_dir, store) = temp_store();
        let legacy = store
            .upsert_actor(&NewActor {
                uri: "https://r.example/users/old".into(),
                username: "old".into(),
                inbox_url: "https://r.example/users/old/inbox".into(),
                legacy: true,
                ..Default::default()
            })
            .unwrap();
        let mut fetcher = crate::collection::tests::StaticFetcher::default();
        fetcher.docs.insert(
            legacy.uri.clone(),
            json!({
                "id": legacy.uri,
                "type": "Person",
                "preferredUsername": "old",
                "inbox": "https://r.example/users/old/inbox",
                "endpoints": {"sharedInbox": "https://r.example/inbox"},
                "followers": "https://r.example/users/old/followers",
            }),
        );
        let a = resolve_remote_actor(&store, &fetcher, &legacy.uri).await.unwrap().unwrap();
        assert_eq!(a.id, legacy.id);
        assert_eq!(a.protocol, crate::store::Protocol::ActivityPub);
        assert_eq!(a.preferred_inbox_url(), "https://r.example/inbox");
    }

    #[tokio::test]
    async fn malformed_json_is_discarded() {
        let f = fixture();
        let bob = remote(&f.store, "r.example", "bob", true);
        let args = ProcessInboundArgs {
            sender_uri: bob.uri.clone(),
            body: "{not json".into(),
            recipient_actor_id: None,
        };
        assert!(matches!(f.ingestor.process(&args).await, Err(JobError::Discard(_))));
    }

    #[tokio::test]
    async fn duplicates_are_suppressed() {
        let f = fixture();
        let bob = remote(&f.store, "r.example", "bob", true);
        let me = local(&f.store, "me");
        let follow = json!({"id": "https://r.example/follows/1", "type": "Follow", "actor": bob.uri, "object": me.uri});
        let out = f.ingestor.process(&inbound(&bob, follow.clone())).await.unwrap();
        assert_eq!(out, IngestOutcome::Processed(vec![]));
        assert!(f.store.is_following(bob.id, me.id).unwrap());
        let again = f.ingestor.process(&inbound(&bob, follow)).await.unwrap();
        assert_eq!(again, IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn reply_to_local_status_is_forwarded() {
        let f = fixture();
        let me = local(&f.store, "me");
        let bob = remote(&f.store, "r.example", "bob", true);
        let parent = f
            .store
            .insert_status(&NewStatus {
                uri: "https://local.example/users/me/statuses/1".into(),
                account_id: me.id,
                visibility: Visibility::Public,
                in_reply_to_id: None,
                in_reply_to_uri: None,
                mentions: vec![],
                quote_of_id: None,
                reblog_of_id: None,
                has_poll: false,
                local: true,
            })
            .unwrap();
        let create = json!({
            "id": "https://r.example/notes/9/activity",
            "type": "Create",
            "actor": bob.uri,
            "object": {
                "id": "https://r.example/notes/9",
                "type": "Note",
                "attributedTo": bob.uri,
                "inReplyTo": parent.uri,
                "to": [PUBLIC_COLLECTION],
            }
        });
        let out = f.ingestor.process(&inbound(&bob, create)).await.unwrap();
        assert_eq!(out, IngestOutcome::Processed(vec![Followup::Forward { status_id: parent.id }]));

        let stored = f.store.status_by_uri("https://r.example/notes/9").unwrap().unwrap();
        assert_eq!(stored.in_reply_to_id, Some(parent.id));

        let jobs = f.queue.pending_jobs(Some(JobKind::Distribute)).await.unwrap();
        let args: DistributeArgs = jobs[0].args().unwrap();
        assert_eq!(args.source_actor_id, me.id);
        assert!(args.excluded_inboxes.contains(&"https://r.example/inbox".to_string()));
    }

    #[tokio::test]
    async fn unknown_parent_and_replies_spawn_crawls() {
        let f = fixture();
        let bob = remote(&f.store, "r.example", "bob", true);
        let create = json!({
            "id": "https://r.example/notes/2/activity",
            "type": "Create",
            "actor": bob.uri,
            "object": {
                "id": "https://r.example/notes/2",
                "type": "Note",
                "attributedTo": bob.uri,
                "inReplyTo": "https://other.example/notes/1",
                "replies": "https://r.example/notes/2/replies",
                "cc": [PUBLIC_COLLECTION],
            }
        });
        f.ingestor.process(&inbound(&bob, create)).await.unwrap();
        assert_eq!(f.queue.pending_jobs(Some(JobKind::ResolveThread)).await.unwrap().len(), 1);
        let crawl = f.queue.pending_jobs(Some(JobKind::CrawlReplies)).await.unwrap();
        let args: CrawlRepliesArgs = crawl[0].args().unwrap();
        assert_eq!(args.uri, "https://r.example/notes/2");
    }

    #[tokio::test]
    async fn foreign_object_create_is_ignored() {
        let f = fixture();
        let bob = remote(&f.store, "r.example", "bob", true);
        let create = json!({
            "id": "https://r.example/notes/3/activity",
            "type": "Create",
            "actor": bob.uri,
            "object": {"id": "https://x.example/notes/3", "type": "Note", "attributedTo": "https://x.example/users/eve"}
        });
        f.ingestor.process(&inbound(&bob, create)).await.unwrap();
        assert!(f.store.status_by_uri("https://x.example/notes/3").unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_followup_enqueue_is_retried_in_full() {
        let f = fixture();
        let bob = remote(&f.store, "r.example", "bob", true);
        let flaky = Arc::new(FlakyQueue::new((*f.queue).clone(), 0));
        let handler = Arc::new(StoreActivityHandler::new(f.store.clone(), "https://local.example"));
        let ingestor = Ingestor::new(f.store.clone(), handler, flaky.clone(), Arc::new(FederationMetrics::new()));
        let create = inbound(
            &bob,
            json!({
                "id": "https://r.example/notes/4/activity",
                "type": "Create",
                "actor": bob.uri,
                "object": {
                    "id": "https://r.example/notes/4",
                    "type": "Note",
                    "attributedTo": bob.uri,
                    "inReplyTo": "https://other.example/notes/1",
                    "to": [PUBLIC_COLLECTION],
                }
            }),
        );

        assert!(matches!(ingestor.process(&create).await, Err(JobError::Retry(_))));
        assert!(f.queue.pending_jobs(Some(JobKind::ResolveThread)).await.unwrap().is_empty());

        flaky.budget.store(u32::MAX, std::sync::atomic::Ordering::SeqCst);
        let out = ingestor.process(&create).await.unwrap();
        assert_eq!(
            out,
            IngestOutcome::Processed(vec![Followup::ResolveThread("https://other.example/notes/1".into())])
        );
        assert_eq!(f.queue.pending_jobs(Some(JobKind::ResolveThread)).await.unwrap().len(), 1);
        assert_eq!(ingestor.process(&create).await.unwrap(), IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn delete_removes_only_own_statuses() {
        let f = fixture();
        let bob = remote(&f.store, "r.example", "bob", true);
        let eve = remote(&f.store, "e.example", "eve", true);
        let note = |id: &str| {
            json!({
                "id": format!("{id}/activity"),
                "type": "Create",
                "actor": bob.uri,
                "object": {"id": id, "type": "Note", "attributedTo": bob.uri, "to": [PUBLIC_COLLECTION]}
            })
        };
        f.ingestor.process(&inbound(&bob, note("https://r.example/notes/5"))).await.unwrap();

        let forged = json!({
            "id": "https://e.example/deletes/1",
            "type": "Delete",
            "actor": eve.uri,
            "object": "https://r.example/notes/5",
        });
        f.ingestor.process(&inbound(&eve, forged)).await.unwrap();
        assert!(f.store.status_by_uri("https://r.example/notes/5").unwrap().is_some());

        let delete = json!({
            "id": "https://r.example/deletes/1",
            "type": "Delete",
            "actor": bob.uri,
            "object": {"id": "https://r.example/notes/5", "type": "Tombstone"},
        });
        f.ingestor.process(&inbound(&bob, delete)).await.unwrap();
        assert!(f.store.status_by_uri("https://r.example/notes/5").unwrap().is_none());
    }
}
