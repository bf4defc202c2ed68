/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Cursor pagination for ActivityPub collections, both directions: emitting
//! our own `OrderedCollection`s and walking remote ones.

use crate::object_fetch::ObjectFetcher;
use anyhow::Result;
use serde_json::{json, Value};
use std::{collections::HashSet, fmt::Display, str::FromStr};
use tracing::debug;

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrder {
    /// Oldest first, `next` carries `min_id`.
    Ascending,
    /// Newest first, `next` carries `max_id`.
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams<C> {
    pub min_id: Option<C>,
    pub max_id: Option<C>,
    pub limit: usize,
    /// False means the caller asked for the collection summary.
    pub page: bool,
}

impl<C> Default for PageParams<C> {
    fn default() -> Self {
        Self {
            min_id: None,
            max_id: None,
            limit: DEFAULT_PAGE_LIMIT,
            page: false,
        }
    }
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

impl<C: FromStr> PageParams<C> {
    pub fn from_query(query: Option<&str>) -> Self {
        let mut out = PageParams::<C>::default();
        let mut limit = None;
        let Some(q) = query else { return out };
        for pair in q.split('&') {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let v = urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_default();
            match k {
                "page" => out.page = matches!(v.as_str(), "true" | "1"),
                "min_id" => {
                    out.min_id = v.parse().ok();
                    out.page = true;
                }
                "max_id" => {
                    out.max_id = v.parse().ok();
                    out.page = true;
                }
                "limit" => limit = v.parse().ok(),
                _ => {}
            }
        }
        out.limit = clamp_limit(limit);
        out
    }
}

/// Renders an `OrderedCollection` summary or one of its pages.
#[derive(Debug, Clone)]
pub struct CollectionEmitter {
    id: String,
    order: PageOrder,
    ordered: bool,
}

impl CollectionEmitter {
    pub fn new(id: impl Into<String>, order: PageOrder) -> Self {
        Self {
            id: id.into(),
            order,
            ordered: true,
        }
    }

    /// Emit `Collection`/`CollectionPage` with `items` instead of the ordered variants.
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    pub fn summary(&self, total: u64) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": self.id,
            "type": if self.ordered { "OrderedCollection" } else { "Collection" },
            "totalItems": total,
            "first": format!("{}?page=true", self.id),
        })
    }

    pub fn page<C: Display>(&self, params: &PageParams<C>, items: Vec<(C, Value)>) -> Value {
        let mut page_id = format!("{}?page=true", self.id);
        if let Some(min) = &params.min_id {
            page_id.push_str(&format!("&min_id={min}"));
        }
        if let Some(max) = &params.max_id {
            page_id.push_str(&format!("&max_id={max}"));
        }

        let (next_key, prev_key) = match self.order {
            PageOrder::Ascending => ("min_id", "max_id"),
            PageOrder::Descending => ("max_id", "min_id"),
        };
        let next = if items.len() >= params.limit {
            items
                .last()
                .map(|(c, _)| format!("{}?page=true&{next_key}={c}", self.id))
        } else {
            None
        };
        let prev = items
            .first()
            .map(|(c, _)| format!("{}?page=true&{prev_key}={c}", self.id));

        let values: Vec<Value> = items.into_iter().map(|(_, v)| v).collect();
        let mut out = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": page_id,
            "type": if self.ordered { "OrderedCollectionPage" } else { "CollectionPage" },
            "partOf": self.id,
        });
        out[if self.ordered { "orderedItems" } else { "items" }] = Value::Array(values);
        if let Some(n) = next {
            out["next"] = Value::String(n);
        }
        if let Some(p) = prev {
            out["prev"] = Value::String(p);
        }
        out
    }

    /// Summary when no page was requested, otherwise the page.
    pub fn respond<C: Display>(&self, params: &PageParams<C>, total: u64, items: Vec<(C, Value)>) -> Value {
        if params.page {
            self.page(params, items)
        } else {
            self.summary(total)
        }
    }
}

/// `id` of a collection item, which may be a bare URI or an embedded object.
pub fn item_id(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Object(m) => m
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

pub fn page_items(page: &Value) -> Vec<Value> {
    page.get("orderedItems")
        .or_else(|| page.get("items"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Why a collection walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEnd {
    /// The last page had no further link.
    Exhausted,
    /// The item or page cap was reached first.
    Capped,
    /// A page could not be fetched, was gone, or linked back to an earlier page.
    Broken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionWalk {
    pub ids: Vec<String>,
    pub end: WalkEnd,
}

impl CollectionWalk {
    fn stop(ids: Vec<String>, end: WalkEnd) -> Self {
        Self { ids, end }
    }

    /// True only when every page of the collection was read.
    pub fn is_complete(&self) -> bool {
        self.end == WalkEnd::Exhausted
    }
}

/// Follows `first`/`next` links of a remote collection, bounded by item and page caps.
pub struct CollectionWalker<'a> {
    fetcher: &'a dyn ObjectFetcher,
    max_items: usize,
    max_pages: usize,
}

impl<'a> CollectionWalker<'a> {
    pub fn new(fetcher: &'a dyn ObjectFetcher, max_items: usize, max_pages: usize) -> Self {
        Self {
            fetcher,
            max_items,
            max_pages,
        }
    }

    /// Item ids in page order, whatever stopped the walk. Failing to fetch the
    /// collection itself is an error.
    pub async fn item_ids(&self, collection: &Value) -> Result<Vec<String>> {
        Ok(self.walk(collection).await?.ids)
    }

    /// Walks `collection` (a URI or an inline collection) and reports how the
    /// walk ended, so callers that act on absence can tell a full listing
    /// from a partial one.
    pub async fn walk(&self, collection: &Value) -> Result<CollectionWalk> {
        let mut out = Vec::new();
        let mut visited = HashSet::<String>::new();

        let mut current = match collection {
            Value::String(url) => {
                visited.insert(url.clone());
                match self.fetcher.fetch(url).await? {
                    Some(v) => v,
                    None => return Ok(CollectionWalk::stop(out, WalkEnd::Broken)),
                }
            }
            Value::Object(_) => collection.clone(),
            _ => return Ok(CollectionWalk::stop(out, WalkEnd::Broken)),
        };

        let mut pages = 0usize;
        loop {
            pages += 1;
            for item in page_items(&current) {
                if out.len() >= self.max_items {
                    return Ok(CollectionWalk::stop(out, WalkEnd::Capped));
                }
                if let Some(id) = item_id(&item) {
                    out.push(id);
                }
            }

            // A collection summary points at `first`; a page points at `next`.
            let link = match current.get("next").or_else(|| current.get("first")) {
                Some(v @ (Value::String(_) | Value::Object(_))) => v.clone(),
                _ => return Ok(CollectionWalk::stop(out, WalkEnd::Exhausted)),
            };
            if out.len() >= self.max_items || pages >= self.max_pages {
                return Ok(CollectionWalk::stop(out, WalkEnd::Capped));
            }

            current = match link {
                Value::String(url) => {
                    if !visited.insert(url.clone()) {
                        debug!("collection page loop at {url}");
                        return Ok(CollectionWalk::stop(out, WalkEnd::Broken));
                    }
                    match self.fetcher.fetch(&url).await {
                        Ok(Some(v)) => v,
                        Ok(None) => return Ok(CollectionWalk::stop(out, WalkEnd::Broken)),
                        Err(e) => {
                            debug!("collection page fetch failed {url}: {e:#}");
                            return Ok(CollectionWalk::stop(out, WalkEnd::Broken));
                        }
                    }
                }
                v => {
                    if let Some(id) = item_id(&v) {
                        if !visited.insert(id) {
                            return Ok(CollectionWalk::stop(out, WalkEnd::Broken));
                        }
                    }
                    v
                }
            };
        }
    }
}
