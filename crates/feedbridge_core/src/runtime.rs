/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor::{actor_uri, build_actor, AS_CONTEXT};
use crate::bootstrap;
use crate::config::{self, FeedsConfig};
use crate::federation::{ActivitySender, ActorResolver, FederationContext};
use crate::feed_db::FeedDb;
use crate::inbox::InboxHandler;
use crate::keys::{self, KeyPair};
use crate::outbox::{self, OutboxMeta, OutboxPage};
use crate::poller::{self, PollerHandle, DEFAULT_POLL_INTERVAL};
use crate::publisher::build_create_activity;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct RuntimeSettings {
    pub base_url: String,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub blocked_instances: HashSet<String>,
}

impl RuntimeSettings {
    pub fn new(base_url: impl Into<String>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            db_path: db_path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            blocked_instances: HashSet::new(),
        }
    }
}

/// The assembled core. The embedding protocol runtime registers
/// [`Runtime::inbox`] as its inbound listener and serves the dispatch
/// lookups (`actor_document`, `key_pairs`, `note_object`, `follow_activity`,
/// outbox and follower collections) from here.
pub struct Runtime {
    db: FeedDb,
    cx: Arc<FederationContext>,
    config: Arc<FeedsConfig>,
    inbox: Arc<InboxHandler>,
    poller: PollerHandle,
}

pub async fn start(
    config: FeedsConfig,
    settings: RuntimeSettings,
    sender: Arc<dyn ActivitySender>,
    resolver: Arc<dyn ActorResolver>,
) -> Result<Runtime> {
    // Unreachable storage is fatal; everything after this point degrades
    // per-item instead.
    let db = FeedDb::open(&settings.db_path).context("open database")?;
    let cx = Arc::new(FederationContext::new(
        settings.base_url.clone(),
        sender,
        resolver,
    ));
    let config = Arc::new(config);

    bootstrap::run(&cx, &db, &config).await;

    let mut blocked = settings.blocked_instances;
    blocked.extend(config::blocked_instances_from_env());
    let inbox = Arc::new(InboxHandler::new(
        cx.clone(),
        db.clone(),
        config.clone(),
        blocked,
    ));
    let poller = poller::start(cx.clone(), db.clone(), config.clone(), settings.poll_interval);

    info!("feedbridge core started with {} bot(s)", config.bots.len());
    Ok(Runtime {
        db,
        cx,
        config,
        inbox,
        poller,
    })
}

impl Runtime {
    pub fn db(&self) -> &FeedDb {
        &self.db
    }

    pub fn config(&self) -> &FeedsConfig {
        &self.config
    }

    /// The inbound event handler to register with the protocol runtime.
    pub fn inbox(&self) -> Arc<InboxHandler> {
        self.inbox.clone()
    }

    /// Lookup-by-username for the actor dispatcher.
    pub fn actor_document(&self, username: &str) -> Result<Option<Value>> {
        let Some(bot) = self.config.bot(username) else {
            return Ok(None);
        };
        let pairs = keys::get_key_pairs(&self.db, username)?;
        let actor = build_actor(&self.cx.base_url, username, bot, &pairs)?;
        Ok(Some(serde_json::to_value(actor)?))
    }

    /// Key-pair provider for the signing layer.
    pub fn key_pairs(&self, username: &str) -> Result<Vec<KeyPair>> {
        if !self.config.has_bot(username) {
            return Ok(Vec::new());
        }
        keys::get_key_pairs(&self.db, username)
    }

    /// Dereference one of our note URLs to its object representation.
    pub fn note_object(&self, username: &str, entry_id: i64) -> Result<Option<Value>> {
        if !self.config.has_bot(username) {
            return Ok(None);
        }
        let Some(entry) = self.db.get_entry(username, entry_id)? else {
            return Ok(None);
        };
        let create = build_create_activity(
            &self.cx.base_url,
            username,
            entry.id,
            &entry.title,
            &entry.url,
            entry.published_at_ms,
        );
        Ok(create.get("object").cloned())
    }

    /// Dereference a Follow we sent, so remote Accepts can fetch it back.
    pub fn follow_activity(&self, follow_activity_id: &str) -> Result<Option<Value>> {
        let Some(row) = self.db.following_by_activity_id(follow_activity_id)? else {
            return Ok(None);
        };
        let Some(target) = row.target_actor_id else {
            return Ok(None);
        };
        Ok(Some(json!({
            "@context": AS_CONTEXT,
            "id": follow_activity_id,
            "type": "Follow",
            "actor": actor_uri(&self.cx.base_url, &row.bot_username),
            "object": target,
        })))
    }

    pub fn outbox(&self, username: &str, cursor: Option<&str>) -> Result<Option<OutboxPage>> {
        if !self.config.has_bot(username) {
            return Ok(None);
        }
        outbox::outbox_page(&self.db, &self.cx.base_url, username, cursor).map(Some)
    }

    pub fn outbox_meta(&self, username: &str) -> Result<Option<OutboxMeta>> {
        if !self.config.has_bot(username) {
            return Ok(None);
        }
        outbox::collection_meta(&self.db, username).map(Some)
    }

    /// Follower actor ids for the followers collection.
    pub fn followers(&self, username: &str) -> Result<Option<Vec<String>>> {
        if !self.config.has_bot(username) {
            return Ok(None);
        }
        self.db.list_followers(username).map(Some)
    }

    /// Stops the poll loop, letting an in-flight cycle finish first.
    pub async fn shutdown(self) {
        self.poller.stop().await;
        info!("feedbridge core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::federation::testing::{MockResolver, MockSender};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const BASE: &str = "https://bots.example";

    fn test_config() -> FeedsConfig {
        let mut bots = BTreeMap::new();
        bots.insert(
            "news".to_string(),
            BotConfig {
                feed_url: "http://127.0.0.1:1/feed.xml".to_string(),
                display_name: "News".to_string(),
                summary: "news".to_string(),
                profile_photo: None,
            },
        );
        FeedsConfig {
            bots,
            follows: vec![],
            relays: vec![],
        }
    }

    async fn test_runtime() -> (TempDir, Runtime) {
        let dir = TempDir::new().unwrap();
        let mut settings = RuntimeSettings::new(BASE, dir.path().join("bots.db"));
        settings.poll_interval = Duration::from_secs(3600);
        let runtime = start(
            test_config(),
            settings,
            Arc::new(MockSender::default()),
            Arc::new(MockResolver::default()),
        )
        .await
        .unwrap();
        (dir, runtime)
    }

    #[tokio::test]
    async fn serves_dispatch_lookups_for_known_bots_only() {
        let (_dir, runtime) = test_runtime().await;

        let doc = runtime.actor_document("news").unwrap().unwrap();
        assert_eq!(doc["preferredUsername"], "news");
        assert!(runtime.actor_document("ghost").unwrap().is_none());

        let pairs = runtime.key_pairs("news").unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(runtime.key_pairs("ghost").unwrap().is_empty());

        assert!(runtime.note_object("news", 1).unwrap().is_none());
        let id = runtime
            .db()
            .insert_entry("news", "g1", "https://example.com/1", "One", None)
            .unwrap()
            .unwrap();
        let note = runtime.note_object("news", id).unwrap().unwrap();
        assert_eq!(note["type"], "Note");
        assert_eq!(
            note["id"],
            format!("https://bots.example/users/news/posts/{id}")
        );

        assert!(runtime.outbox_meta("news").unwrap().is_some());
        assert!(runtime.outbox("ghost", None).unwrap().is_none());
        assert_eq!(runtime.followers("news").unwrap().unwrap().len(), 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn follow_activity_round_trips_from_storage() {
        let (_dir, runtime) = test_runtime().await;
        let follow_id = "https://bots.example/users/news/follows/abc";
        runtime
            .db()
            .upsert_following("news", "admin@social.example", "https://social.example/u/admin", follow_id)
            .unwrap();

        let follow = runtime.follow_activity(follow_id).unwrap().unwrap();
        assert_eq!(follow["type"], "Follow");
        assert_eq!(follow["actor"], "https://bots.example/users/news");
        assert_eq!(follow["object"], "https://social.example/u/admin");

        assert!(runtime.follow_activity("https://bots.example/unknown").unwrap().is_none());
        runtime.shutdown().await;
    }
}
