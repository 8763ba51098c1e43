/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A delivery target: actor id plus the inbox the activity is POSTed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub id: String,
    pub inbox: String,
}

/// A dereferenced remote actor.
#[derive(Clone, Debug)]
pub struct ResolvedActor {
    pub id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
}

impl ResolvedActor {
    /// Preferred delivery endpoint: shared inbox when the remote server
    /// exposes one.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox.as_deref().unwrap_or(&self.inbox)
    }

    pub fn as_recipient(&self) -> Recipient {
        Recipient {
            id: self.id.clone(),
            inbox: self.inbox.clone(),
        }
    }
}

/// Outbound send primitive. The implementation signs as the given bot and
/// enqueues durable delivery; the core never touches signatures or retries.
#[async_trait]
pub trait ActivitySender: Send + Sync {
    async fn send(
        &self,
        bot_username: &str,
        recipients: &[Recipient],
        activity: Value,
    ) -> Result<()>;
}

/// Remote actor resolution (webfinger handle or actor URL to a dereferenced
/// actor document), provided by the protocol runtime.
#[async_trait]
pub trait ActorResolver: Send + Sync {
    async fn resolve_handle(&self, handle: &str) -> Result<ResolvedActor>;
    async fn resolve_url(&self, url: &str) -> Result<ResolvedActor>;
}

/// Everything a component needs to speak to the outside federation.
/// Constructed once at startup and passed down explicitly.
#[derive(Clone)]
pub struct FederationContext {
    pub base_url: String,
    pub sender: Arc<dyn ActivitySender>,
    pub resolver: Arc<dyn ActorResolver>,
}

impl FederationContext {
    pub fn new(
        base_url: impl Into<String>,
        sender: Arc<dyn ActivitySender>,
        resolver: Arc<dyn ActorResolver>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            sender,
            resolver,
        }
    }
}
