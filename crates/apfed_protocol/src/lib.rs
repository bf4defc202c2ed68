/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by the federation engine: job arguments persisted in the
//! queue and the `Collection-Synchronization` header.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const COLLECTION_SYNCHRONIZATION_HEADER: &str = "Collection-Synchronization";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Deliver,
    Distribute,
    ProcessInbound,
    FetchReply,
    CrawlReplies,
    ResolveThread,
    ResolveActor,
    SynchronizeFollowers,
}

impl JobKind {
    pub const ALL: [JobKind; 8] = [
        JobKind::Deliver,
        JobKind::Distribute,
        JobKind::ProcessInbound,
        JobKind::FetchReply,
        JobKind::CrawlReplies,
        JobKind::ResolveThread,
        JobKind::ResolveActor,
        JobKind::SynchronizeFollowers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Deliver => "deliver",
            JobKind::Distribute => "distribute",
            JobKind::ProcessInbound => "process_inbound",
            JobKind::FetchReply => "fetch_reply",
            JobKind::CrawlReplies => "crawl_replies",
            JobKind::ResolveThread => "resolve_thread",
            JobKind::ResolveActor => "resolve_actor",
            JobKind::SynchronizeFollowers => "synchronize_followers",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == input.trim())
    }

    /// Retry budget per kind. Destinations are often down for hours, so
    /// deliveries get the largest budget.
    pub fn default_max_attempts(&self) -> u32 {
        match self {
            JobKind::Deliver => 16,
            JobKind::ProcessInbound => 8,
            JobKind::Distribute => 5,
            JobKind::FetchReply
            | JobKind::CrawlReplies
            | JobKind::ResolveThread
            | JobKind::ResolveActor
            | JobKind::SynchronizeFollowers => 3,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryOptions {
    #[serde(default)]
    pub synchronize_followers: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeliverArgs {
    pub body: String,
    pub source_actor_id: i64,
    pub inbox_url: String,
    #[serde(default)]
    pub options: DeliveryOptions,
}

/// Which audience a distribution reaches. Resolved into inboxes by the core.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DistributionEvent {
    Status { status_id: i64 },
    StatusUpdate { status_id: i64 },
    PollUpdate { status_id: i64 },
    ProfileUpdate { actor_id: i64 },
    Move { actor_id: i64, target_actor_id: i64 },
    GroupUpdate { group_actor_id: i64 },
    QuoteRequest { status_id: i64, quoted_status_id: i64 },
    Forward { status_id: i64 },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DistributeArgs {
    pub body: String,
    pub source_actor_id: i64,
    pub event: DistributionEvent,
    #[serde(default)]
    pub excluded_inboxes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProcessInboundArgs {
    pub sender_uri: String,
    pub body: String,
    #[serde(default)]
    pub recipient_actor_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FetchReplyArgs {
    pub uri: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CrawlRepliesArgs {
    pub uri: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResolveThreadArgs {
    pub uri: String,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResolveActorArgs {
    pub uri: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SynchronizeFollowersArgs {
    pub remote_actor_id: i64,
    pub url: String,
}

/// `collectionId="<followers-url>", digest="<hex>", url="<sync-endpoint>"`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CollectionSynchronization {
    pub collection_id: String,
    pub digest: String,
    pub url: String,
}

impl CollectionSynchronization {
    pub fn to_header_value(&self) -> String {
        format!(
            "collectionId=\"{}\", digest=\"{}\", url=\"{}\"",
            self.collection_id, self.digest, self.url
        )
    }
}

impl fmt::Display for CollectionSynchronization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_kind_names_are_stable() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::from_str("nope"), None);
        assert_eq!(JobKind::Deliver.default_max_attempts(), 16);
    }

    #[test]
    fn distribution_event_is_tagged() {
        let ev = DistributionEvent::Move {
            actor_id: 1,
            target_actor_id: 2,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["kind"], "move");
        assert_eq!(v["target_actor_id"], 2);
    }

    #[test]
    fn deliver_args_default_options() {
        let args: DeliverArgs = serde_json::from_str(
            r#"{"body":"{}","source_actor_id":3,"inbox_url":"https://a.example/inbox"}"#,
        )
        .unwrap();
        assert!(!args.options.synchronize_followers);
    }

    #[test]
    fn synchronization_header_format() {
        let h = CollectionSynchronization {
            collection_id: "https://l.example/users/a/followers".to_string(),
            digest: "abcd".to_string(),
            url: "https://l.example/users/a/followers_synchronization".to_string(),
        };
        assert_eq!(
            h.to_header_value(),
            "collectionId=\"https://l.example/users/a/followers\", digest=\"abcd\", url=\"https://l.example/users/a/followers_synchronization\""
        );
    }
}
