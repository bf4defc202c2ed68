/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Inbound HTTP surface: inboxes and the collections remote servers page through.

use crate::collection::{CollectionEmitter, PageOrder, PageParams};
use crate::followers_sync::{origin_prefix, synchronization_url};
use crate::http_sig::{RequestVerifier, VerifyError};
use crate::inbox::{GateDecision, InboxGate};
use crate::metrics::FederationMetrics;
use crate::store::{Actor, FederationStore, Visibility};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, Response, StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info_span};

const ACTIVITY_JSON: &str = "application/activity+json; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FederationStore>,
    pub gate: Arc<InboxGate>,
    pub verifier: Arc<dyn RequestVerifier>,
    pub metrics: Arc<FederationMetrics>,
    pub max_body_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let max_body = state.max_body_bytes;
    Router::new()
        .route("/inbox", post(shared_inbox))
        .route("/users/:name/inbox", post(user_inbox))
        .route("/users/:name/followers", get(followers))
        .route("/users/:name/followers_synchronization", get(followers_synchronization))
        .route("/users/:name/statuses/:id/replies", get(replies))
        .route("/healthz", get(healthz))
        // Oversized inbox bodies are answered by the gate with 413 itself.
        .layer(axum::extract::DefaultBodyLimit::max(max_body.saturating_add(1)))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
            info_span!("http", method = %req.method(), uri = %req.uri())
        }))
        .with_state(state)
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

fn activity_json(v: &Value) -> Response<Body> {
    (StatusCode::OK, [("Content-Type", ACTIVITY_JSON)], v.to_string()).into_response()
}

fn internal(context: &str, e: anyhow::Error) -> Response<Body> {
    error!("{context}: {e:#}");
    simple(StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable")
}

fn local_actor(state: &AppState, name: &str) -> Result<Actor, Response<Body>> {
    match state.store.local_actor_by_username(name) {
        Ok(Some(a)) if !a.suspended => Ok(a),
        Ok(_) => Err(simple(StatusCode::NOT_FOUND, "not found")),
        Err(e) => Err(internal("actor lookup", e)),
    }
}

async fn receive(
    state: &AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    recipient: Option<i64>,
) -> Response<Body> {
    match state.gate.receive(&method, &uri, &headers, &body, recipient).await {
        Ok(GateDecision::Accepted(_)) | Ok(GateDecision::Ghost) => simple(StatusCode::ACCEPTED, ""),
        Ok(GateDecision::TooLarge) => simple(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"),
        Ok(GateDecision::Rejected(reason)) => simple(StatusCode::UNAUTHORIZED, &reason),
        Err(e) => internal("inbox", e),
    }
}

async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    receive(&state, method, uri, headers, body, None).await
}

async fn user_inbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let actor = match local_actor(&state, &name) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    receive(&state, method, uri, headers, body, Some(actor.id)).await
}

async fn followers(State(state): State<AppState>, Path(name): Path<String>, uri: Uri) -> impl IntoResponse {
    let actor = match local_actor(&state, &name) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let id = actor
        .followers_url
        .clone()
        .unwrap_or_else(|| format!("{}/followers", actor.uri));
    let params = PageParams::<i64>::from_query(uri.query());
    let emitter = CollectionEmitter::new(id, PageOrder::Descending);

    let result = (|| {
        let total = state.store.follower_count(actor.id)?;
        let items = if params.page {
            state
                .store
                .followers_page(actor.id, &params, PageOrder::Descending)?
                .into_iter()
                .map(|(cursor, uri)| (cursor, Value::String(uri)))
                .collect()
        } else {
            Vec::new()
        };
        anyhow::Ok(emitter.respond(&params, total, items))
    })();
    match result {
        Ok(v) => activity_json(&v),
        Err(e) => internal("followers", e),
    }
}

/// Followers of `name` living on the requester's origin. The request must be
/// signed so we know which origin is asking.
async fn followers_synchronization(
    State(state): State<AppState>,
    Path(name): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let actor = match local_actor(&state, &name) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let requester = match state.verifier.verify(&method, &uri, &headers, &[]).await {
        Ok(a) => a,
        Err(VerifyError::Rejected(reason)) => return simple(StatusCode::UNAUTHORIZED, &reason),
        Err(VerifyError::Internal(e)) => return internal("followers_synchronization", e),
    };
    let Some(prefix) = origin_prefix(&requester.uri) else {
        return simple(StatusCode::BAD_REQUEST, "requester has no origin");
    };
    let uris = match state.store.follower_uris_with_prefix(actor.id, &prefix) {
        Ok(v) => v,
        Err(e) => return internal("followers_synchronization", e),
    };
    activity_json(&json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": synchronization_url(&actor.uri),
        "type": "OrderedCollection",
        "totalItems": uris.len(),
        "orderedItems": uris,
    }))
}

async fn replies(
    State(state): State<AppState>,
    Path((name, status_id)): Path<(String, i64)>,
    uri: Uri,
) -> impl IntoResponse {
    let actor = match local_actor(&state, &name) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let status = match state.store.status(status_id) {
        Ok(Some(s))
            if s.account_id == actor.id && matches!(s.visibility, Visibility::Public | Visibility::Unlisted) =>
        {
            s
        }
        Ok(_) => return simple(StatusCode::NOT_FOUND, "not found"),
        Err(e) => return internal("replies", e),
    };
    let params = PageParams::<i64>::from_query(uri.query());
    let emitter = CollectionEmitter::new(format!("{}/replies", status.uri), PageOrder::Ascending);

    let result = (|| {
        let total = state.store.count_replies(status.id)?;
        let items = if params.page {
            state
                .store
                .replies_page(status.id, &params, PageOrder::Ascending)?
                .into_iter()
                .map(|(cursor, uri)| (cursor, Value::String(uri)))
                .collect()
        } else {
            Vec::new()
        };
        anyhow::Ok(emitter.respond(&params, total, items))
    })();
    match result {
        Ok(v) => activity_json(&v),
        Err(e) => internal("replies", e),
    }
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "ok": true,
        "version": crate::version(),
        "metrics": state.metrics.snapshot_json(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure_tracker::FailureTracker;
    use crate::inbox::tests::FixedVerifier;
    use crate::job_queue::tests::temp_queue;
    use crate::job_queue::SqliteJobQueue;
    use crate::store::tests::{local, remote, temp_store};
    use crate::store::{NewStatus, SqliteStore};
    use apfed_protocol::JobKind;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Fixture {
        _sdir: tempfile::TempDir,
        _qdir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        queue: Arc<SqliteJobQueue>,
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
            }
        }

        fn app(&self, sender: Option<Actor>) -> Router {
            let verifier: Arc<dyn RequestVerifier> = Arc::new(FixedVerifier { actor: sender });
            let metrics = Arc::new(FederationMetrics::new());
            let gate = InboxGate::new(
                self.store.clone(),
                verifier.clone(),
                self.queue.clone(),
                Arc::new(FailureTracker::new(7)),
                metrics.clone(),
                1024,
            );
            router(AppState {
                store: self.store.clone(),
                gate: Arc::new(gate),
                verifier,
                metrics,
                max_body_bytes: 1024,
            })
        }
    }

    async fn body_json(resp: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(path: &str, body: &Value) -> Request<Body> {
        Request::post(path)
            .header("Content-Type", "application/activity+json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn accepted_inbox_post_is_queued() {
        let f = Fixture::new();
        let me = local(&f.store, "me");
        let bob = remote(&f.store, "r.example", "bob", true);
        let follow = json!({
            "id": "https://r.example/activities/1",
            "type": "Follow",
            "actor": bob.uri,
            "object": me.uri,
        });
        let resp = f.app(Some(bob)).oneshot(post_json("/users/me/inbox", &follow)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(f.queue.pending_jobs(Some(JobKind::ProcessInbound)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsigned_post_gets_reason() {
        let f = Fixture::new();
        let resp = f
            .app(None)
            .oneshot(post_json("/inbox", &json!({"type": "Create"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"signature invalid");
        assert!(f.queue.pending_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ghost_delete_is_accepted_without_work() {
        let f = Fixture::new();
        let ghost = "https://gone.example/users/x";
        let resp = f
            .app(None)
            .oneshot(post_json("/inbox", &json!({"type": "Delete", "actor": ghost, "object": ghost})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(f.queue.pending_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_post_is_413() {
        let f = Fixture::new();
        let bob = remote(&f.store, "r.example", "bob", true);
        let big = json!({"type": "Create", "content": "x".repeat(4096)});
        let resp = f.app(Some(bob)).oneshot(post_json("/inbox", &big)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unknown_user_inbox_is_404() {
        let f = Fixture::new();
        let resp = f
            .app(None)
            .oneshot(post_json("/users/nobody/inbox", &json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn followers_pages_cover_every_follower_once() {
        let f = Fixture::new();
        let me = local(&f.store, "me");
        for i in 0..5 {
            let a = remote(&f.store, "a.example", &format!("u{i}"), false);
            f.store.add_follow(a.id, me.id).unwrap();
        }
        let app = f.app(None);

        let summary = body_json(
            app.clone()
                .oneshot(Request::get("/users/me/followers").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(summary["type"], "OrderedCollection");
        assert_eq!(summary["totalItems"], 5);

        let mut seen = Vec::new();
        let mut next = Some("/users/me/followers?page=true&limit=2".to_string());
        let mut last_len = 0;
        while let Some(path) = next.take() {
            let page = body_json(app.clone().oneshot(Request::get(&path).body(Body::empty()).unwrap()).await.unwrap()).await;
            let items = page["orderedItems"].as_array().unwrap().clone();
            last_len = items.len();
            seen.extend(items.into_iter().map(|v| v.as_str().unwrap().to_string()));
            next = page["next"]
                .as_str()
                .map(|n| n.trim_start_matches("https://local.example").to_string() + "&limit=2");
        }
        assert_eq!(seen.len(), 5);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);
        assert!(last_len < 2);
    }

    #[tokio::test]
    async fn synchronization_collection_is_scoped_to_requester_origin() {
        let f = Fixture::new();
        let me = local(&f.store, "me");
        let a = remote(&f.store, "a.example", "alice", true);
        let b = remote(&f.store, "b.example", "bob", true);
        f.store.add_follow(a.id, me.id).unwrap();
        f.store.add_follow(b.id, me.id).unwrap();

        let resp = f
            .app(Some(a.clone()))
            .oneshot(Request::get("/users/me/followers_synchronization").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["orderedItems"], json!([a.uri]));

        let resp = f
            .app(None)
            .oneshot(Request::get("/users/me/followers_synchronization").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn replies_hide_non_public_statuses() {
        let f = Fixture::new();
        let me = local(&f.store, "me");
        let bob = remote(&f.store, "r.example", "bob", true);
        let mk = |uri: &str, account_id: i64, visibility: Visibility, parent: Option<i64>| NewStatus {
            uri: uri.into(),
            account_id,
            visibility,
            in_reply_to_id: parent,
            in_reply_to_uri: None,
            mentions: vec![],
            quote_of_id: None,
            reblog_of_id: None,
            has_poll: false,
            local: account_id == me.id,
        };
        let root = f
            .store
            .insert_status(&mk("https://local.example/users/me/statuses/1", me.id, Visibility::Public, None))
            .unwrap();
        let secret = f
            .store
            .insert_status(&mk("https://local.example/users/me/statuses/2", me.id, Visibility::Direct, None))
            .unwrap();
        f.store
            .insert_status(&mk("https://r.example/notes/1", bob.id, Visibility::Public, Some(root.id)))
            .unwrap();

        let app = f.app(None);
        let v = body_json(
            app.clone()
                .oneshot(
                    Request::get(format!("/users/me/statuses/{}/replies?page=true", root.id))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(v["orderedItems"], json!(["https://r.example/notes/1"]));
        assert_eq!(v["partOf"], "https://local.example/users/me/statuses/1/replies");

        let resp = app
            .oneshot(
                Request::get(format!("/users/me/statuses/{}/replies", secret.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
