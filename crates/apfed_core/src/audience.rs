/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Who receives an event. One strategy per event kind; every strategy
//! produces an [`Audience`], a set keyed by inbox URL so actors sharing an
//! inbox yield a single delivery.

use crate::store::{Actor, FederationStore, InteractionKind, Protocol, Status, Visibility};
use anyhow::Result;
use apfed_protocol::{DeliveryOptions, DistributionEvent};
use std::collections::BTreeMap;

pub struct AudienceContext<'a> {
    pub store: &'a dyn FederationStore,
    pub sync_followers_threshold: u64,
    pub synchronization_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub inbox_url: String,
    pub options: DeliveryOptions,
}

#[derive(Debug, Default, Clone)]
pub struct Audience {
    targets: BTreeMap<String, DeliveryOptions>,
}

impl Audience {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the actor's preferred inbox unless it is local, suspended or
    /// only reachable over the legacy protocol.
    pub fn add_actor(&mut self, actor: &Actor, options: DeliveryOptions) {
        if actor.local || actor.suspended || actor.protocol == Protocol::Legacy {
            return;
        }
        self.add_inbox(actor.preferred_inbox_url(), options);
    }

    pub fn add_actors<'a>(&mut self, actors: impl IntoIterator<Item = &'a Actor>, options: DeliveryOptions) {
        for a in actors {
            self.add_actor(a, options);
        }
    }

    pub fn add_inbox(&mut self, inbox_url: &str, options: DeliveryOptions) {
        let url = inbox_url.trim();
        if url.is_empty() {
            return;
        }
        let entry = self.targets.entry(url.to_string()).or_default();
        entry.synchronize_followers |= options.synchronize_followers;
    }

    pub fn exclude<S: AsRef<str>>(&mut self, inboxes: &[S]) {
        for i in inboxes {
            self.targets.remove(i.as_ref().trim());
        }
    }

    pub fn merge(&mut self, other: Audience) {
        for (url, opts) in other.targets {
            self.add_inbox(&url, opts);
        }
    }

    pub fn contains(&self, inbox_url: &str) -> bool {
        self.targets.contains_key(inbox_url)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets sorted by inbox URL.
    pub fn into_targets(self) -> Vec<DeliveryTarget> {
        self.targets
            .into_iter()
            .map(|(inbox_url, options)| DeliveryTarget { inbox_url, options })
            .collect()
    }
}

pub trait AudienceStrategy: Send + Sync {
    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience>;
    /// Names the event this strategy resolves, e.g. `status:42`. Two
    /// distributions of one payload with different scopes are unrelated.
    fn scope(&self) -> String;
}

pub fn strategy_for(event: &DistributionEvent) -> Box<dyn AudienceStrategy> {
    match event {
        DistributionEvent::Status { status_id } => Box::new(StatusAudience { status_id: *status_id }),
        DistributionEvent::StatusUpdate { status_id } => Box::new(StatusUpdateAudience { status_id: *status_id }),
        DistributionEvent::PollUpdate { status_id } => Box::new(PollUpdateAudience { status_id: *status_id }),
        DistributionEvent::ProfileUpdate { actor_id } => Box::new(ProfileUpdateAudience { actor_id: *actor_id }),
        DistributionEvent::Move {
            actor_id,
            target_actor_id,
        } => Box::new(MoveAudience {
            actor_id: *actor_id,
            target_actor_id: *target_actor_id,
        }),
        DistributionEvent::GroupUpdate { group_actor_id } => Box::new(GroupUpdateAudience {
            group_actor_id: *group_actor_id,
        }),
        DistributionEvent::QuoteRequest { quoted_status_id, .. } => Box::new(QuoteRequestAudience {
            quoted_status_id: *quoted_status_id,
        }),
        DistributionEvent::Forward { status_id } => Box::new(ForwardAudience::for_status(*status_id)),
    }
}

fn follower_options(ctx: &AudienceContext<'_>, author: &Actor, visibility: Visibility) -> Result<DeliveryOptions> {
    let restricted = visibility == Visibility::Private;
    let synchronize_followers = restricted
        && !ctx.synchronization_disabled
        && ctx.store.follower_count(author.id)? < ctx.sync_followers_threshold;
    Ok(DeliveryOptions { synchronize_followers })
}

fn add_status_author(ctx: &AudienceContext<'_>, audience: &mut Audience, status_id: Option<i64>) -> Result<()> {
    let Some(id) = status_id else { return Ok(()) };
    if let Some(s) = ctx.store.status(id)? {
        if let Some(a) = ctx.store.actor(s.account_id)? {
            audience.add_actor(&a, DeliveryOptions::default());
        }
    }
    Ok(())
}

fn add_relays(ctx: &AudienceContext<'_>, audience: &mut Audience) -> Result<()> {
    for r in ctx.store.relay_inboxes()? {
        audience.add_inbox(&r, DeliveryOptions::default());
    }
    Ok(())
}

fn load_status(ctx: &AudienceContext<'_>, status_id: i64) -> Result<Option<(Status, Actor)>> {
    let Some(status) = ctx.store.status(status_id)? else {
        return Ok(None);
    };
    let Some(author) = ctx.store.actor(status.account_id)? else {
        return Ok(None);
    };
    Ok(Some((status, author)))
}

/// Create, delete or reblog of a status.
pub struct StatusAudience {
    pub status_id: i64,
}

impl AudienceStrategy for StatusAudience {
    fn scope(&self) -> String {
        format!("status:{}", self.status_id)
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = Audience::new();
        let Some((status, author)) = load_status(ctx, self.status_id)? else {
            return Ok(audience);
        };

        if status.visibility.reaches_followers() {
            let opts = follower_options(ctx, &author, status.visibility)?;
            audience.add_actors(&ctx.store.followers(author.id)?, opts);
        }
        for id in &status.mentions {
            if let Some(a) = ctx.store.actor(*id)? {
                audience.add_actor(&a, DeliveryOptions::default());
            }
        }
        // Thread parent, quoted and reblogged authors are addressed parties too.
        add_status_author(ctx, &mut audience, status.in_reply_to_id)?;
        add_status_author(ctx, &mut audience, status.quote_of_id)?;
        add_status_author(ctx, &mut audience, status.reblog_of_id)?;

        if status.visibility == Visibility::Public {
            add_relays(ctx, &mut audience)?;
        }
        Ok(audience)
    }
}

/// Edit: everyone who saw the original must see the change.
pub struct StatusUpdateAudience {
    pub status_id: i64,
}

impl AudienceStrategy for StatusUpdateAudience {
    fn scope(&self) -> String {
        format!("status_update:{}", self.status_id)
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = StatusAudience {
            status_id: self.status_id,
        }
        .resolve_audience(ctx)?;
        let Some((status, _)) = load_status(ctx, self.status_id)? else {
            return Ok(audience);
        };
        let mut kinds = vec![InteractionKind::Reblog, InteractionKind::Quote];
        if status.has_poll {
            kinds.push(InteractionKind::Vote);
        }
        for kind in kinds {
            audience.add_actors(&ctx.store.status_interactors(status.id, kind)?, DeliveryOptions::default());
        }
        Ok(audience)
    }
}

/// Poll results changed.
pub struct PollUpdateAudience {
    pub status_id: i64,
}

impl AudienceStrategy for PollUpdateAudience {
    fn scope(&self) -> String {
        format!("poll_update:{}", self.status_id)
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = Audience::new();
        let Some((status, author)) = load_status(ctx, self.status_id)? else {
            return Ok(audience);
        };
        audience.add_actors(
            &ctx.store.status_interactors(status.id, InteractionKind::Vote)?,
            DeliveryOptions::default(),
        );
        if status.visibility.reaches_followers() {
            let opts = follower_options(ctx, &author, status.visibility)?;
            audience.add_actors(&ctx.store.followers(author.id)?, opts);
        }
        Ok(audience)
    }
}

/// Profile changes reach followers, accounts the owner follows, and relays.
pub struct ProfileUpdateAudience {
    pub actor_id: i64,
}

impl AudienceStrategy for ProfileUpdateAudience {
    fn scope(&self) -> String {
        format!("profile_update:{}", self.actor_id)
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = Audience::new();
        if ctx.store.actor(self.actor_id)?.is_none() {
            return Ok(audience);
        }
        audience.add_actors(&ctx.store.followers(self.actor_id)?, DeliveryOptions::default());
        audience.add_actors(&ctx.store.following(self.actor_id)?, DeliveryOptions::default());
        add_relays(ctx, &mut audience)?;
        Ok(audience)
    }
}

pub struct MoveAudience {
    pub actor_id: i64,
    pub target_actor_id: i64,
}

impl AudienceStrategy for MoveAudience {
    fn scope(&self) -> String {
        format!("move:{}:{}", self.actor_id, self.target_actor_id)
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = Audience::new();
        if ctx.store.actor(self.actor_id)?.is_none() {
            return Ok(audience);
        }
        audience.add_actors(&ctx.store.followers(self.actor_id)?, DeliveryOptions::default());
        if let Some(target) = ctx.store.actor(self.target_actor_id)? {
            audience.add_actor(&target, DeliveryOptions::default());
        }
        Ok(audience)
    }
}

/// Group members are the group's followers.
pub struct GroupUpdateAudience {
    pub group_actor_id: i64,
}

impl AudienceStrategy for GroupUpdateAudience {
    fn scope(&self) -> String {
        format!("group_update:{}", self.group_actor_id)
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = Audience::new();
        audience.add_actors(&ctx.store.followers(self.group_actor_id)?, DeliveryOptions::default());
        Ok(audience)
    }
}

/// A quote request goes to the quoted author only.
pub struct QuoteRequestAudience {
    pub quoted_status_id: i64,
}

impl AudienceStrategy for QuoteRequestAudience {
    fn scope(&self) -> String {
        format!("quote_request:{}", self.quoted_status_id)
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = Audience::new();
        add_status_author(ctx, &mut audience, Some(self.quoted_status_id))?;
        Ok(audience)
    }
}

/// Re-delivery of someone else's activity to the participants of a local
/// thread: the followers of the local status' author plus any explicit inboxes.
pub struct ForwardAudience {
    pub status_id: Option<i64>,
    pub inboxes: Vec<String>,
}

impl ForwardAudience {
    pub fn for_status(status_id: i64) -> Self {
        Self {
            status_id: Some(status_id),
            inboxes: Vec::new(),
        }
    }

    pub fn explicit(inboxes: Vec<String>) -> Self {
        Self {
            status_id: None,
            inboxes,
        }
    }
}

impl AudienceStrategy for ForwardAudience {
    fn scope(&self) -> String {
        let mut inboxes: Vec<&str> = self.inboxes.iter().map(|i| i.trim()).collect();
        inboxes.sort_unstable();
        inboxes.dedup();
        match self.status_id {
            Some(id) => format!("forward:{id}:{}", inboxes.join(" ")),
            None => format!("forward:{}", inboxes.join(" ")),
        }
    }

    fn resolve_audience(&self, ctx: &AudienceContext<'_>) -> Result<Audience> {
        let mut audience = Audience::new();
        for i in &self.inboxes {
            audience.add_inbox(i, DeliveryOptions::default());
        }
        if let Some(id) = self.status_id {
            if let Some((status, author)) = load_status(ctx, id)? {
                if author.local && status.visibility.reaches_followers() {
                    audience.add_actors(&ctx.store.followers(author.id)?, DeliveryOptions::default());
                }
            }
        }
        Ok(audience)
    }
}
