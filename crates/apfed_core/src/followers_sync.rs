/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Followers-collection synchronization: both sides compute an
//! order-independent digest over the follower URIs living on one origin and
//! reconcile when they disagree.

use crate::collection::{CollectionWalker, WalkEnd};
use crate::http_sig::parse_signature_params;
use crate::job_queue::{job_args, JobQueue};
use crate::object_fetch::ObjectFetcher;
use crate::store::{Actor, FederationStore};
use anyhow::{bail, Result};
use apfed_protocol::{CollectionSynchronization, DeliverArgs, DeliveryOptions, JobKind, SynchronizeFollowersArgs};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info, warn};

/// Hex of the XOR of SHA-256 over every URI. The empty set digests to zeros.
pub fn followers_digest<I, S>(uris: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut acc = [0u8; 32];
    for uri in uris {
        let h = Sha256::digest(uri.as_ref().as_bytes());
        for (a, b) in acc.iter_mut().zip(h.iter()) {
            *a ^= b;
        }
    }
    hex::encode(acc)
}

/// `scheme://host[:port]/` of a URL.
pub fn origin_prefix(url: &str) -> Option<String> {
    let u = reqwest::Url::parse(url.trim()).ok()?;
    let host = u.host_str()?.to_ascii_lowercase();
    Some(match u.port() {
        Some(p) => format!("{}://{host}:{p}/", u.scheme()),
        None => format!("{}://{host}/", u.scheme()),
    })
}

pub fn synchronization_url(actor_uri: &str) -> String {
    format!("{}/followers_synchronization", actor_uri.trim_end_matches('/'))
}

/// Header for a delivery from `actor` to `inbox_url`, covering `actor`'s
/// followers on the inbox's origin. None when the actor has no followers URL.
pub fn build_header(store: &dyn FederationStore, actor: &Actor, inbox_url: &str) -> Result<Option<CollectionSynchronization>> {
    let Some(collection_id) = actor.followers_url.clone().filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    let Some(prefix) = origin_prefix(inbox_url) else {
        return Ok(None);
    };
    let uris = store.follower_uris_with_prefix(actor.id, &prefix)?;
    Ok(Some(CollectionSynchronization {
        collection_id,
        digest: followers_digest(&uris),
        url: synchronization_url(&actor.uri),
    }))
}

pub fn parse_header(value: &str) -> Option<CollectionSynchronization> {
    let p = parse_signature_params(value);
    let get = |k: &str| p.get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    Some(CollectionSynchronization {
        collection_id: get("collectionId")?,
        digest: get("digest")?,
        url: get("url")?,
    })
}

/// Decides whether a header received from `sender` warrants a
/// `synchronize_followers` job: the collection must be the sender's own
/// followers, the URL must be on the sender's origin, and our digest of the
/// sender's local followers must differ.
pub fn needs_synchronization(
    store: &dyn FederationStore,
    sender: &Actor,
    header: &CollectionSynchronization,
) -> Result<Option<SynchronizeFollowersArgs>> {
    if sender.followers_url.as_deref() != Some(header.collection_id.as_str()) {
        debug!("sync header collection mismatch from {}", sender.uri);
        return Ok(None);
    }
    if origin_prefix(&header.url).is_none() || origin_prefix(&header.url) != origin_prefix(&sender.uri) {
        debug!("sync header url off-origin from {}", sender.uri);
        return Ok(None);
    }
    let local = store.local_followers_of(sender.id)?;
    let ours = followers_digest(local.iter().map(|a| a.uri.as_str()));
    if ours.eq_ignore_ascii_case(&header.digest) {
        return Ok(None);
    }
    Ok(Some(SynchronizeFollowersArgs {
        remote_actor_id: sender.id,
        url: header.url.clone(),
    }))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub removed: usize,
    pub undone: usize,
}

pub fn undo_follow_json(follower: &Actor, target: &Actor) -> serde_json::Value {
    let follow_id = format!("{}#follows/{}", follower.uri, target.id);
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{follow_id}/undo"),
        "type": "Undo",
        "actor": follower.uri,
        "object": {
            "id": follow_id,
            "type": "Follow",
            "actor": follower.uri,
            "object": target.uri,
        }
    })
}

pub struct FollowersSynchronizer {
    store: Arc<dyn FederationStore>,
    fetcher: Arc<dyn ObjectFetcher>,
    queue: Arc<dyn JobQueue>,
    local_prefix: String,
    max_items: usize,
    max_pages: usize,
}

impl FollowersSynchronizer {
    pub fn new(
        store: Arc<dyn FederationStore>,
        fetcher: Arc<dyn ObjectFetcher>,
        queue: Arc<dyn JobQueue>,
        local_base_url: &str,
        max_items: usize,
        max_pages: usize,
    ) -> Self {
        let local_prefix = origin_prefix(local_base_url).unwrap_or_else(|| local_base_url.to_string());
        Self {
            store,
            fetcher,
            queue,
            local_prefix,
            max_items,
            max_pages,
        }
    }

    pub async fn synchronize(&self, args: &SynchronizeFollowersArgs) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let Some(remote) = self.store.actor(args.remote_actor_id)? else {
            return Ok(report);
        };

        // Absence from the list removes follows, so only a full listing counts.
        let walker = CollectionWalker::new(self.fetcher.as_ref(), self.max_items, self.max_pages);
        let walk = walker.walk(&serde_json::Value::String(args.url.clone())).await?;
        match walk.end {
            WalkEnd::Exhausted => {}
            WalkEnd::Broken => bail!("followers list at {} is incomplete", args.url),
            WalkEnd::Capped => {
                warn!(
                    "followers list at {} exceeds {} items or {} pages, not reconciling",
                    args.url, self.max_items, self.max_pages
                );
                return Ok(report);
            }
        }
        let listed: HashSet<String> = walk
            .ids
            .into_iter()
            .filter(|u| u.starts_with(&self.local_prefix))
            .collect();

        // Local follows the remote side does not know about.
        for follower in self.store.local_followers_of(remote.id)? {
            if !listed.contains(&follower.uri) {
                if self.store.remove_follow(follower.id, remote.id)? {
                    report.removed += 1;
                }
            }
        }

        // Follows the remote side has that we do not.
        let mut undo = Vec::new();
        for uri in &listed {
            let Some(local) = self.store.actor_by_uri(uri)?.filter(|a| a.local) else {
                continue;
            };
            if self.store.is_following(local.id, remote.id)? {
                continue;
            }
            undo.push(job_args(&DeliverArgs {
                body: undo_follow_json(&local, &remote).to_string(),
                source_actor_id: local.id,
                inbox_url: remote.inbox_url.clone(),
                options: DeliveryOptions::default(),
            })?);
        }
        report.undone = self.queue.enqueue_bulk(JobKind::Deliver, undo).await?;

        if report.removed > 0 || report.undone > 0 {
            info!(
                "followers sync with {}: removed {} undone {}",
                remote.uri, report.removed, report.undone
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::tests::StaticFetcher;
    use crate::job_queue::tests::temp_queue;
    use crate::job_queue::SqliteJobQueue;
    use crate::store::tests::{local, remote, temp_store};
    use crate::store::SqliteStore;

    #[test]
    fn digest_is_order_independent_and_sensitive() {
        let a = followers_digest(["https://l.example/users/a", "https://l.example/users/b"]);
        let b = followers_digest(["https://l.example/users/b", "https://l.example/users/a"]);
        assert_eq!(a, b);
        let c = followers_digest(["https://l.example/users/a", "https://l.example/users/c"]);
        assert_ne!(a, c);
        assert_eq!(followers_digest(Vec::<String>::new()), "0".repeat(64));
    }

    #[test]
    fn single_uri_digest_is_its_hash() {
        let uri = "https://l.example/users/a";
        assert_eq!(followers_digest([uri]), hex::encode(Sha256::digest(uri.as_bytes())));
    }

    #[test]
    fn origin_prefix_keeps_port() {
        assert_eq!(origin_prefix("https://A.example/inbox").unwrap(), "https://a.example/");
        assert_eq!(origin_prefix("http://127.0.0.1:8080/x").unwrap(), "http://127.0.0.1:8080/");
        assert!(origin_prefix("nope").is_none());
    }

    #[test]
    fn header_round_trip() {
        let h = CollectionSynchronization {
            collection_id: "https://r.example/users/bob/followers".into(),
            digest: "ab12".into(),
            url: "https://r.example/users/bob/followers_synchronization".into(),
        };
        assert_eq!(parse_header(&h.to_header_value()), Some(h));
        assert_eq!(parse_header(r#"collectionId="x", digest="y""#), None);
    }

    #[test]
    fn header_covers_followers_on_inbox_origin() {
        let (_dir, store) = temp_store();
        let me = local(&store, "me");
        let a = remote(&store, "a.example", "alice", true);
        let b = remote(&store, "b.example", "bob", true);
        store.add_follow(a.id, me.id).unwrap();
        store.add_follow(b.id, me.id).unwrap();
        let h = build_header(&store, &me, "https://a.example/inbox").unwrap().unwrap();
        assert_eq!(h.digest, followers_digest([a.uri.as_str()]));
        assert_eq!(h.url, "https://local.example/users/me/followers_synchronization");
        assert_eq!(h.collection_id, "https://local.example/users/me/followers");
    }

    #[test]
    fn mismatched_digest_requests_sync() {
        let (_dir, store) = temp_store();
        let me = local(&store, "me");
        let bob = remote(&store, "r.example", "bob", true);
        store.add_follow(me.id, bob.id).unwrap();
        let good = CollectionSynchronization {
            collection_id: bob.followers_url.clone().unwrap(),
            digest: followers_digest([me.uri.as_str()]),
            url: synchronization_url(&bob.uri),
        };
        assert!(needs_synchronization(&store, &bob, &good).unwrap().is_none());

        let stale = CollectionSynchronization {
            digest: followers_digest(Vec::<String>::new()),
            ..good.clone()
        };
        let args = needs_synchronization(&store, &bob, &stale).unwrap().unwrap();
        assert_eq!(args.remote_actor_id, bob.id);

        let foreign = CollectionSynchronization {
            url: "https://evil.example/sync".into(),
            ..stale.clone()
        };
        assert!(needs_synchronization(&store, &bob, &foreign).unwrap().is_none());
    }

    #[tokio::test]
    async fn reconciliation_unfollows_and_undoes() {
        let (_dir, store) = temp_store();
        let (_qdir, queue) = temp_queue();
        let me = local(&store, "me");
        let you = local(&store, "you");
        let bob = remote(&store, "r.example", "bob", true);
        // We think `me` follows bob; bob's list says only `you` does.
        store.add_follow(me.id, bob.id).unwrap();

        let url = synchronization_url(&bob.uri);
        let mut fetcher = StaticFetcher::default();
        fetcher.docs.insert(
            url.clone(),
            json!({"id": url.clone(), "type": "OrderedCollection", "orderedItems": [you.uri.clone(), "https://other.example/users/x"]}),
        );

        let store = Arc::new(store);
        let queue = Arc::new(queue);
        let sync = FollowersSynchronizer::new(
            store.clone(),
            Arc::new(fetcher),
            queue.clone(),
            "https://local.example",
            1000,
            10,
        );
        let report = sync
            .synchronize(&SynchronizeFollowersArgs { remote_actor_id: bob.id, url })
            .await
            .unwrap();
        assert_eq!(report, SyncReport { removed: 1, undone: 1 });
        assert!(!store.is_following(me.id, bob.id).unwrap());

        let jobs = queue.pending_jobs(Some(JobKind::Deliver)).await.unwrap();
        let args: DeliverArgs = jobs[0].args().unwrap();
        assert_eq!(args.source_actor_id, you.id);
        assert_eq!(args.inbox_url, bob.inbox_url);
        let body: serde_json::Value = serde_json::from_str(&args.body).unwrap();
        assert_eq!(body["type"], "Undo");
        assert_eq!(body["object"]["object"], bob.uri);
    }

    fn synchronizer(store: &Arc<SqliteStore>, queue: &Arc<SqliteJobQueue>, fetcher: StaticFetcher, max_items: usize) -> FollowersSynchronizer {
        FollowersSynchronizer::new(
            store.clone(),
            Arc::new(fetcher),
            queue.clone(),
            "https://local.example",
            max_items,
            10,
        )
    }

    #[tokio::test]
    async fn broken_page_link_keeps_every_follow() {
        let (_dir, store) = temp_store();
        let (_qdir, queue) = temp_queue();
        let me = local(&store, "me");
        let you = local(&store, "you");
        let bob = remote(&store, "r.example", "bob", true);
        store.add_follow(me.id, bob.id).unwrap();
        store.add_follow(you.id, bob.id).unwrap();

        // Page one lists `me`; the page listing `you` never loads.
        let url = synchronization_url(&bob.uri);
        let mut fetcher = StaticFetcher::default();
        fetcher.docs.insert(
            url.clone(),
            json!({
                "id": url.clone(),
                "type": "OrderedCollection",
                "first": {"type": "OrderedCollectionPage", "orderedItems": [me.uri.clone()], "next": format!("{url}?page=2")},
            }),
        );

        let store = Arc::new(store);
        let queue = Arc::new(queue);
        let sync = synchronizer(&store, &queue, fetcher, 1000);
        let args = SynchronizeFollowersArgs { remote_actor_id: bob.id, url };
        assert!(sync.synchronize(&args).await.is_err());
        assert!(store.is_following(me.id, bob.id).unwrap());
        assert!(store.is_following(you.id, bob.id).unwrap());
        assert!(queue.pending_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_list_is_left_alone() {
        let (_dir, store) = temp_store();
        let (_qdir, queue) = temp_queue();
        let me = local(&store, "me");
        let you = local(&store, "you");
        let bob = remote(&store, "r.example", "bob", true);
        store.add_follow(you.id, bob.id).unwrap();

        let url = synchronization_url(&bob.uri);
        let mut fetcher = StaticFetcher::default();
        fetcher.docs.insert(
            url.clone(),
            json!({"id": url.clone(), "type": "OrderedCollection", "orderedItems": [me.uri.clone(), you.uri.clone()]}),
        );

        let store = Arc::new(store);
        let queue = Arc::new(queue);
        let sync = synchronizer(&store, &queue, fetcher, 1);
        let report = sync
            .synchronize(&SynchronizeFollowersArgs { remote_actor_id: bob.id, url })
            .await
            .unwrap();
        assert_eq!(report, SyncReport::default());
        assert!(store.is_following(you.id, bob.id).unwrap());
        assert!(queue.pending_jobs(None).await.unwrap().is_empty());
    }
}
