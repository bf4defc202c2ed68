/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::collection::{PageOrder, PageParams};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    ActivityPub,
    /// Accounts discovered through an older protocol; upgraded on first signed contact.
    Legacy,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::ActivityPub => "activitypub",
            Protocol::Legacy => "legacy",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "legacy" => Protocol::Legacy,
            _ => Protocol::ActivityPub,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Unlisted,
    /// Followers only.
    Private,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
            Visibility::Direct => "direct",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "public" => Visibility::Public,
            "unlisted" => Visibility::Unlisted,
            "private" => Visibility::Private,
            _ => Visibility::Direct,
        }
    }

    pub fn reaches_followers(&self) -> bool {
        !matches!(self, Visibility::Direct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Reblog,
    Quote,
    Vote,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::Reblog => "reblog",
            InteractionKind::Quote => "quote",
            InteractionKind::Vote => "vote",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub uri: String,
    pub username: String,
    pub local: bool,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
    pub protocol: Protocol,
    pub suspended: bool,
    pub stale: bool,
}

impl Actor {
    /// Shared inbox when the server advertises one, personal inbox otherwise.
    pub fn preferred_inbox_url(&self) -> &str {
        match self.shared_inbox_url.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => &self.inbox_url,
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.uri)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewActor {
    pub uri: String,
    pub username: String,
    pub local: bool,
    pub inbox_url: String,
    pub shared_inbox_url: Option<String>,
    pub followers_url: Option<String>,
    pub public_key_pem: Option<String>,
    pub private_key_pem: Option<String>,
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: i64,
    pub uri: String,
    pub account_id: i64,
    pub visibility: Visibility,
    pub in_reply_to_id: Option<i64>,
    pub in_reply_to_uri: Option<String>,
    pub mentions: Vec<i64>,
    pub quote_of_id: Option<i64>,
    pub reblog_of_id: Option<i64>,
    pub has_poll: bool,
    pub local: bool,
}

#[derive(Debug, Clone)]
pub struct NewStatus {
    pub uri: String,
    pub account_id: i64,
    pub visibility: Visibility,
    pub in_reply_to_id: Option<i64>,
    pub in_reply_to_uri: Option<String>,
    pub mentions: Vec<i64>,
    pub quote_of_id: Option<i64>,
    pub reblog_of_id: Option<i64>,
    pub has_poll: bool,
    pub local: bool,
}

/// Everything the federation engine reads from or writes to persistent state.
pub trait FederationStore: Send + Sync {
    fn actor(&self, id: i64) -> Result<Option<Actor>>;
    fn actor_by_uri(&self, uri: &str) -> Result<Option<Actor>>;
    fn local_actor_by_username(&self, username: &str) -> Result<Option<Actor>>;
    /// Inserts or refreshes by URI. Refreshing clears the stale marker.
    fn upsert_actor(&self, actor: &NewActor) -> Result<Actor>;
    fn mark_actor_stale(&self, id: i64) -> Result<()>;
    fn set_actor_suspended(&self, id: i64, suspended: bool) -> Result<()>;

    /// Actors following `actor_id`, oldest follow first.
    fn followers(&self, actor_id: i64) -> Result<Vec<Actor>>;
    fn follower_count(&self, actor_id: i64) -> Result<u64>;
    fn follower_uris_with_prefix(&self, actor_id: i64, prefix: &str) -> Result<Vec<String>>;
    /// Local actors that follow the (usually remote) `target_id`.
    fn local_followers_of(&self, target_id: i64) -> Result<Vec<Actor>>;
    fn following(&self, actor_id: i64) -> Result<Vec<Actor>>;
    fn add_follow(&self, follower_id: i64, target_id: i64) -> Result<()>;
    fn remove_follow(&self, follower_id: i64, target_id: i64) -> Result<bool>;
    fn is_following(&self, follower_id: i64, target_id: i64) -> Result<bool>;
    /// Follower URIs keyed by follow row id.
    fn followers_page(&self, actor_id: i64, page: &PageParams<i64>, order: PageOrder) -> Result<Vec<(i64, String)>>;

    fn status(&self, id: i64) -> Result<Option<Status>>;
    fn status_by_uri(&self, uri: &str) -> Result<Option<Status>>;
    /// Idempotent by URI.
    fn insert_status(&self, status: &NewStatus) -> Result<Status>;
    /// Removes the status with its mentions and interactions. False when it did not exist.
    fn delete_status(&self, id: i64) -> Result<bool>;
    fn add_interaction(&self, status_id: i64, actor_id: i64, kind: InteractionKind) -> Result<()>;
    fn status_interactors(&self, status_id: i64, kind: InteractionKind) -> Result<Vec<Actor>>;
    /// Public and unlisted replies, keyed by status id.
    fn replies_page(&self, status_id: i64, page: &PageParams<i64>, order: PageOrder) -> Result<Vec<(i64, String)>>;
    fn count_replies(&self, status_id: i64) -> Result<u64>;

    fn relay_inboxes(&self) -> Result<Vec<String>>;
    fn add_relay(&self, inbox_url: &str) -> Result<()>;

    /// Returns false when the id was already recorded.
    fn mark_activity_seen(&self, activity_id: &str) -> Result<bool>;
    /// Undoes `mark_activity_seen` so a failed activity can be processed again.
    fn forget_activity(&self, activity_id: &str) -> Result<()>;
    fn store_inbound_activity(&self, activity_id: &str, sender_uri: &str, ty: Option<&str>, json: &[u8]) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS actors (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uri TEXT NOT NULL UNIQUE,
              username TEXT NOT NULL,
              local INTEGER NOT NULL,
              inbox_url TEXT NOT NULL,
              shared_inbox_url TEXT NULL,
              followers_url TEXT NULL,
              public_key_pem TEXT NULL,
              private_key_pem TEXT NULL,
              protocol TEXT NOT NULL,
              suspended INTEGER NOT NULL DEFAULT 0,
              stale INTEGER NOT NULL DEFAULT 0,
              updated_at_ms INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_actors_local_username ON actors(username) WHERE local=1;

            CREATE TABLE IF NOT EXISTS follows (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              follower_id INTEGER NOT NULL,
              target_id INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              UNIQUE(follower_id, target_id)
            );
            CREATE INDEX IF NOT EXISTS idx_follows_target ON follows(target_id, id);

            CREATE TABLE IF NOT EXISTS statuses (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uri TEXT NOT NULL UNIQUE,
              account_id INTEGER NOT NULL,
              visibility TEXT NOT NULL,
              in_reply_to_id INTEGER NULL,
              in_reply_to_uri TEXT NULL,
              quote_of_id INTEGER NULL,
              has_poll INTEGER NOT NULL DEFAULT 0,
              local INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_statuses_reply ON statuses(in_reply_to_id, id);

            CREATE TABLE IF NOT EXISTS status_mentions (
              status_id INTEGER NOT NULL,
              actor_id INTEGER NOT NULL,
              PRIMARY KEY(status_id, actor_id)
            );

            CREATE TABLE IF NOT EXISTS status_interactions (
              status_id INTEGER NOT NULL,
              actor_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY(status_id, actor_id, kind)
            );

            CREATE TABLE IF NOT EXISTS relays (
              inbox_url TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inbox_seen (
              activity_id TEXT PRIMARY KEY,
              seen_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS inbox_items (
              activity_id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              actor_id TEXT NULL,
              type TEXT NULL,
              activity_json BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbox_created ON inbox_items(created_at_ms DESC);
            "#,
        )?;
        ensure_columns(&conn, "statuses", &[("reblog_of_id", "INTEGER NULL")])?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path).with_context(|| format!("open db: {}", self.path.display()))
    }

    fn status_from_row(conn: &Connection, r: &Row<'_>) -> rusqlite::Result<Status> {
        let id: i64 = r.get(0)?;
        let visibility: String = r.get(3)?;
        let mut stmt = conn.prepare_cached("SELECT actor_id FROM status_mentions WHERE status_id=?1 ORDER BY actor_id")?;
        let mentions = stmt
            .query_map(params![id], |m| m.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Status {
            id,
            uri: r.get(1)?,
            account_id: r.get(2)?,
            visibility: Visibility::from_db(&visibility),
            in_reply_to_id: r.get(4)?,
            in_reply_to_uri: r.get(5)?,
            mentions,
            quote_of_id: r.get(6)?,
            has_poll: r.get::<_, i64>(7)? != 0,
            local: r.get::<_, i64>(8)? != 0,
            reblog_of_id: r.get(9)?,
        })
    }

    fn query_actors(&self, sql: &str, p: impl rusqlite::Params) -> Result<Vec<Actor>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(p, actor_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_status(&self, where_clause: &str, p: impl rusqlite::Params) -> Result<Option<Status>> {
        let conn = self.conn()?;
        let sql = format!("{STATUS_COLUMNS} WHERE {where_clause}");
        let status = conn
            .query_row(&sql, p, |r| Self::status_from_row(&conn, r))
            .optional()?;
        Ok(status)
    }
}

const ACTOR_COLUMNS: &str = "SELECT a.id, a.uri, a.username, a.local, a.inbox_url, a.shared_inbox_url, a.followers_url, a.public_key_pem, a.private_key_pem, a.protocol, a.suspended, a.stale FROM actors a";

const STATUS_COLUMNS: &str =
    "SELECT id, uri, account_id, visibility, in_reply_to_id, in_reply_to_uri, quote_of_id, has_poll, local, reblog_of_id FROM statuses";

fn actor_from_row(r: &Row<'_>) -> rusqlite::Result<Actor> {
    let protocol: String = r.get(9)?;
    Ok(Actor {
        id: r.get(0)?,
        uri: r.get(1)?,
        username: r.get(2)?,
        local: r.get::<_, i64>(3)? != 0,
        inbox_url: r.get(4)?,
        shared_inbox_url: r.get(5)?,
        followers_url: r.get(6)?,
        public_key_pem: r.get(7)?,
        private_key_pem: r.get(8)?,
        protocol: Protocol::from_db(&protocol),
        suspended: r.get::<_, i64>(10)? != 0,
        stale: r.get::<_, i64>(11)? != 0,
    })
}

/// Builds `WHERE`/`ORDER BY` for id-cursor pagination. When only `min_id` is
/// set on a descending listing (or only `max_id` on an ascending one) the
/// nearest rows are selected in reverse and flipped afterwards.
fn cursor_clause(column: &str, page: &PageParams<i64>, order: PageOrder) -> (String, bool) {
    let mut conds = Vec::new();
    if let Some(min) = page.min_id {
        conds.push(format!("{column} > {min}"));
    }
    if let Some(max) = page.max_id {
        conds.push(format!("{column} < {max}"));
    }
    let flip = match order {
        PageOrder::Descending => page.min_id.is_some() && page.max_id.is_none(),
        PageOrder::Ascending => page.max_id.is_some() && page.min_id.is_none(),
    };
    let ascending = matches!(order, PageOrder::Ascending) != flip;
    let where_sql = if conds.is_empty() {
        String::new()
    } else {
        format!(" AND {}", conds.join(" AND "))
    };
    let dir = if ascending { "ASC" } else { "DESC" };
    (format!("{where_sql} ORDER BY {column} {dir} LIMIT {}", page.limit), flip)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn ensure_columns(conn: &Connection, table: &str, cols: &[(&str, &str)]) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut existing = std::collections::HashSet::new();
    for r in rows {
        existing.insert(r?);
    }
    for (name, ty) in cols {
        if !existing.contains(*name) {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {ty}"), [])?;
        }
    }
    Ok(())
}

impl FederationStore for SqliteStore {
    fn actor(&self, id: i64) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        let sql = format!("{ACTOR_COLUMNS} WHERE a.id=?1");
        Ok(conn.query_row(&sql, params![id], actor_from_row).optional()?)
    }

    fn actor_by_uri(&self, uri: &str) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        let sql = format!("{ACTOR_COLUMNS} WHERE a.uri=?1");
        Ok(conn.query_row(&sql, params![uri.trim()], actor_from_row).optional()?)
    }

    fn local_actor_by_username(&self, username: &str) -> Result<Option<Actor>> {
        let conn = self.conn()?;
        let sql = format!("{ACTOR_COLUMNS} WHERE a.local=1 AND a.username=?1");
        Ok(conn.query_row(&sql, params![username.trim()], actor_from_row).optional()?)
    }

    fn upsert_actor(&self, actor: &NewActor) -> Result<Actor> {
        let uri = actor.uri.trim();
        if uri.is_empty() {
            return Err(anyhow!("actor uri is empty"));
        }
        let protocol = if actor.legacy { Protocol::Legacy } else { Protocol::ActivityPub };
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO actors(uri, username, local, inbox_url, shared_inbox_url, followers_url, public_key_pem, private_key_pem, protocol, suspended, stale, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10)
            ON CONFLICT(uri) DO UPDATE SET
              username=excluded.username,
              inbox_url=excluded.inbox_url,
              shared_inbox_url=excluded.shared_inbox_url,
              followers_url=excluded.followers_url,
              public_key_pem=COALESCE(excluded.public_key_pem, actors.public_key_pem),
              private_key_pem=COALESCE(excluded.private_key_pem, actors.private_key_pem),
              protocol=excluded.protocol,
              stale=0,
              updated_at_ms=excluded.updated_at_ms
            "#,
            params![
                uri,
                actor.username,
                actor.local as i64,
                actor.inbox_url,
                actor.shared_inbox_url,
                actor.followers_url,
                actor.public_key_pem,
                actor.private_key_pem,
                protocol.as_str(),
                now_ms()
            ],
        )?;
        let sql = format!("{ACTOR_COLUMNS} WHERE a.uri=?1");
        Ok(conn.query_row(&sql, params![uri], actor_from_row)?)
    }

    fn mark_actor_stale(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE actors SET stale=1 WHERE id=?1", params![id])?;
        Ok(())
    }

    fn set_actor_suspended(&self, id: i64, suspended: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("UPDATE actors SET suspended=?2 WHERE id=?1", params![id, suspended as i64])?;
        Ok(())
    }

    fn followers(&self, actor_id: i64) -> Result<Vec<Actor>> {
        let sql = format!("{ACTOR_COLUMNS} JOIN follows f ON f.follower_id=a.id WHERE f.target_id=?1 ORDER BY f.id ASC");
        self.query_actors(&sql, params![actor_id])
    }

    fn follower_count(&self, actor_id: i64) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM follows WHERE target_id=?1",
            params![actor_id],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn follower_uris_with_prefix(&self, actor_id: i64, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT a.uri FROM actors a JOIN follows f ON f.follower_id=a.id
            WHERE f.target_id=?1 AND substr(a.uri, 1, length(?2))=?2
            ORDER BY f.id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![actor_id, prefix], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn local_followers_of(&self, target_id: i64) -> Result<Vec<Actor>> {
        let sql = format!(
            "{ACTOR_COLUMNS} JOIN follows f ON f.follower_id=a.id WHERE f.target_id=?1 AND a.local=1 ORDER BY f.id ASC"
        );
        self.query_actors(&sql, params![target_id])
    }

    fn following(&self, actor_id: i64) -> Result<Vec<Actor>> {
        let sql = format!("{ACTOR_COLUMNS} JOIN follows f ON f.target_id=a.id WHERE f.follower_id=?1 ORDER BY f.id ASC");
        self.query_actors(&sql, params![actor_id])
    }

    fn add_follow(&self, follower_id: i64, target_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO follows(follower_id, target_id, created_at_ms) VALUES (?1, ?2, ?3)",
            params![follower_id, target_id, now_ms()],
        )?;
        Ok(())
    }

    fn remove_follow(&self, follower_id: i64, target_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM follows WHERE follower_id=?1 AND target_id=?2",
            params![follower_id, target_id],
        )?;
        Ok(n > 0)
    }

    fn is_following(&self, follower_id: i64, target_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let hit: Option<i64> = conn
            .query_row(
                "SELECT id FROM follows WHERE follower_id=?1 AND target_id=?2",
                params![follower_id, target_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(hit.is_some())
    }

    fn followers_page(&self, actor_id: i64, page: &PageParams<i64>, order: PageOrder) -> Result<Vec<(i64, String)>> {
        let (tail, flip) = cursor_clause("f.id", page, order);
        let sql = format!(
            "SELECT f.id, a.uri FROM follows f JOIN actors a ON a.id=f.follower_id WHERE f.target_id=?1{tail}"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![actor_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?;
        let mut items = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        if flip {
            items.reverse();
        }
        Ok(items)
    }

    fn status(&self, id: i64) -> Result<Option<Status>> {
        self.query_status("id=?1", params![id])
    }

    fn status_by_uri(&self, uri: &str) -> Result<Option<Status>> {
        self.query_status("uri=?1", params![uri.trim()])
    }

    fn insert_status(&self, status: &NewStatus) -> Result<Status> {
        let uri = status.uri.trim();
        if uri.is_empty() {
            return Err(anyhow!("status uri is empty"));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO statuses(uri, account_id, visibility, in_reply_to_id, in_reply_to_uri, quote_of_id, has_poll, local, created_at_ms, reblog_of_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                uri,
                status.account_id,
                status.visibility.as_str(),
                status.in_reply_to_id,
                status.in_reply_to_uri,
                status.quote_of_id,
                status.has_poll as i64,
                status.local as i64,
                now_ms(),
                status.reblog_of_id
            ],
        )?;
        if inserted > 0 {
            let id = tx.last_insert_rowid();
            for m in &status.mentions {
                tx.execute(
                    "INSERT OR IGNORE INTO status_mentions(status_id, actor_id) VALUES (?1, ?2)",
                    params![id, m],
                )?;
            }
        }
        tx.commit()?;
        self.status_by_uri(uri)?
            .ok_or_else(|| anyhow!("status vanished after insert: {uri}"))
    }

    fn delete_status(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM status_mentions WHERE status_id=?1", params![id])?;
        tx.execute("DELETE FROM status_interactions WHERE status_id=?1", params![id])?;
        let n = tx.execute("DELETE FROM statuses WHERE id=?1", params![id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    fn add_interaction(&self, status_id: i64, actor_id: i64, kind: InteractionKind) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO status_interactions(status_id, actor_id, kind, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![status_id, actor_id, kind.as_str(), now_ms()],
        )?;
        Ok(())
    }

    fn status_interactors(&self, status_id: i64, kind: InteractionKind) -> Result<Vec<Actor>> {
        let sql = format!(
            "{ACTOR_COLUMNS} JOIN status_interactions i ON i.actor_id=a.id WHERE i.status_id=?1 AND i.kind=?2 ORDER BY i.created_at_ms ASC"
        );
        self.query_actors(&sql, params![status_id, kind.as_str()])
    }

    fn replies_page(&self, status_id: i64, page: &PageParams<i64>, order: PageOrder) -> Result<Vec<(i64, String)>> {
        let (tail, flip) = cursor_clause("id", page, order);
        let sql = format!(
            "SELECT id, uri FROM statuses WHERE in_reply_to_id=?1 AND visibility IN ('public','unlisted'){tail}"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?;
        let mut items = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        if flip {
            items.reverse();
        }
        Ok(items)
    }

    fn count_replies(&self, status_id: i64) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM statuses WHERE in_reply_to_id=?1 AND visibility IN ('public','unlisted')",
            params![status_id],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    fn relay_inboxes(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT inbox_url FROM relays ORDER BY inbox_url")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn add_relay(&self, inbox_url: &str) -> Result<()> {
        let inbox_url = inbox_url.trim();
        if inbox_url.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO relays(inbox_url, created_at_ms) VALUES (?1, ?2)",
            params![inbox_url, now_ms()],
        )?;
        Ok(())
    }

    fn mark_activity_seen(&self, activity_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO inbox_seen(activity_id, seen_at_ms) VALUES (?1, ?2)",
            params![activity_id, now_ms()],
        )?;
        Ok(n > 0)
    }

    fn forget_activity(&self, activity_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM inbox_seen WHERE activity_id=?1", params![activity_id])?;
        Ok(())
    }

    fn store_inbound_activity(&self, activity_id: &str, sender_uri: &str, ty: Option<&str>, json: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO inbox_items(activity_id, created_at_ms, actor_id, type, activity_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![activity_id, now_ms(), sender_uri, ty, json],
        )?;
        Ok(())
    }
}
