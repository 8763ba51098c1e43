/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor::{actor_uri, new_follow_id, parse_actor_uri, parse_note_uri, AS_CONTEXT};
use crate::config::FeedsConfig;
use crate::federation::FederationContext;
use crate::feed_db::{FeedDb, RelationshipStatus};
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Interprets inbound protocol events and mutates relationship state.
///
/// The protocol runtime may deliver events concurrently, out of order and
/// more than once, so every handler is safe to re-run: all mutations go
/// through insert-or-ignore / conditional-update statements keyed on the
/// unique constraints. Malformed or foreign references are expected from the
/// open network and are ignored, never surfaced as errors.
pub struct InboxHandler {
    cx: Arc<FederationContext>,
    db: FeedDb,
    config: Arc<FeedsConfig>,
    blocked_instances: HashSet<String>,
}

impl InboxHandler {
    pub fn new(
        cx: Arc<FederationContext>,
        db: FeedDb,
        config: Arc<FeedsConfig>,
        blocked_instances: HashSet<String>,
    ) -> Self {
        Self {
            cx,
            db,
            config,
            blocked_instances,
        }
    }

    pub async fn handle(&self, activity: &Value) -> Result<()> {
        let ty = activity.get("type").and_then(Value::as_str).unwrap_or("");
        match ty {
            "Follow" => self.handle_follow(activity).await,
            "Undo" => self.handle_undo(activity).await,
            "Accept" => self.handle_follow_response(activity, RelationshipStatus::Accepted),
            "Reject" => self.handle_follow_response(activity, RelationshipStatus::Rejected),
            "Like" | "EmojiReact" => self.handle_like(activity, ty),
            "Announce" => self.handle_announce(activity),
            "Delete" => self.handle_delete(activity),
            _ => Ok(()),
        }
    }

    async fn handle_follow(&self, activity: &Value) -> Result<()> {
        let follow_id = activity.get("id").and_then(Value::as_str);
        let actor_id = activity.get("actor").and_then(Value::as_str);
        let object = activity.get("object").and_then(Value::as_str);
        let (Some(follow_id), Some(actor_id), Some(object)) = (follow_id, actor_id, object) else {
            warn!("Follow ignored: missing id, actor, or object");
            return Ok(());
        };

        let Some(username) = parse_actor_uri(&self.cx.base_url, object) else {
            warn!("Follow ignored: {object} is not one of our actors");
            return Ok(());
        };
        if !self.config.has_bot(&username) {
            warn!("Follow ignored: unknown bot {username}");
            return Ok(());
        }

        let follower = match self.cx.resolver.resolve_url(actor_id).await {
            Ok(f) => f,
            Err(e) => {
                error!("failed to resolve actor {actor_id}: {e:#}");
                return Ok(());
            }
        };

        let me = actor_uri(&self.cx.base_url, &username);
        if let Some(host) = url_host(&follower.id) {
            if self.blocked_instances.contains(&host) {
                info!("rejecting follow from blocked instance {host}");
                let reject = json!({
                    "@context": AS_CONTEXT,
                    "id": format!("{me}#reject-{}", new_follow_id()),
                    "type": "Reject",
                    "actor": me,
                    "to": [follower.id.clone()],
                    "object": activity.clone(),
                });
                if let Err(e) = self
                    .cx
                    .sender
                    .send(&username, &[follower.as_recipient()], reject)
                    .await
                {
                    warn!("failed to send Reject to {}: {e:#}", follower.id);
                }
                return Ok(());
            }
        }

        self.db.add_follower(
            &username,
            &follower.id,
            follow_id,
            Some(follower.delivery_inbox()),
        )?;
        info!("accepting follow {} -> {username}", follower.id);

        let accept = json!({
            "@context": AS_CONTEXT,
            "id": format!("{me}#accept-{}", new_follow_id()),
            "type": "Accept",
            "actor": me,
            "to": [follower.id.clone()],
            "object": activity.clone(),
        });
        if let Err(e) = self
            .cx
            .sender
            .send(&username, &[follower.as_recipient()], accept)
            .await
        {
            warn!("failed to send Accept to {}: {e:#}", follower.id);
        }
        Ok(())
    }

    async fn handle_undo(&self, activity: &Value) -> Result<()> {
        let actor = activity.get("actor").and_then(Value::as_str).unwrap_or("");
        let Some(object) = activity.get("object") else {
            return Ok(());
        };
        if !object.is_object() {
            // A bare id gives us nothing to discriminate on.
            debug!("Undo ignored: object is not inline");
            return Ok(());
        }

        match object.get("type").and_then(Value::as_str).unwrap_or("") {
            "Follow" => {
                let Some(target) = object.get("object").and_then(Value::as_str) else {
                    debug!("Undo Follow ignored: missing target");
                    return Ok(());
                };
                let Some(username) = parse_actor_uri(&self.cx.base_url, target) else {
                    debug!("Undo Follow ignored: {target} is not one of our actors");
                    return Ok(());
                };
                if !self.config.has_bot(&username) || actor.is_empty() {
                    debug!("Undo Follow ignored: unknown bot or missing actor");
                    return Ok(());
                }
                self.db.remove_follower(&username, actor)?;
                info!("removed follower {actor} from {username}");
            }
            "Like" | "EmojiReact" => {
                if let Some((username, entry_id)) =
                    self.note_ref(extract_object_id(object), "Undo Like")
                {
                    self.db.decrement_like_count(&username, entry_id)?;
                    info!("undo like on {username}/posts/{entry_id}");
                }
            }
            "Announce" => {
                if let Some((username, entry_id)) =
                    self.note_ref(extract_object_id(object), "Undo Announce")
                {
                    self.db.decrement_boost_count(&username, entry_id)?;
                    info!("undo boost on {username}/posts/{entry_id}");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Accept/Reject of a Follow we sent, correlated by the follow activity
    /// id. Relay subscriptions and per-bot follows share that namespace, so
    /// both tables are tried.
    fn handle_follow_response(&self, activity: &Value, status: RelationshipStatus) -> Result<()> {
        let follow_id = match activity.get("object") {
            // Some servers echo only the Follow activity id.
            Some(Value::String(id)) => id.clone(),
            Some(obj @ Value::Object(_)) => {
                if obj.get("type").and_then(Value::as_str) != Some("Follow") {
                    debug!("{} ignored: object is not a Follow", status.as_str());
                    return Ok(());
                }
                match obj.get("id").and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => {
                        debug!("{} ignored: Follow object has no id", status.as_str());
                        return Ok(());
                    }
                }
            }
            _ => {
                debug!("{} ignored: missing object", status.as_str());
                return Ok(());
            }
        };

        let relay_matched = self.db.set_relay_status(&follow_id, status)?;
        let following_matched = self.db.set_following_status(&follow_id, status)?;
        if relay_matched || following_matched {
            info!("follow {follow_id} marked {}", status.as_str());
        } else {
            debug!("{} ignored: {follow_id} matches nothing we sent", status.as_str());
        }
        Ok(())
    }

    fn handle_like(&self, activity: &Value, label: &str) -> Result<()> {
        if let Some((username, entry_id)) = self.note_ref(extract_object_id(activity), label) {
            self.db.increment_like_count(&username, entry_id)?;
            info!("{label} on {username}/posts/{entry_id}");
        }
        Ok(())
    }

    fn handle_announce(&self, activity: &Value) -> Result<()> {
        if let Some((username, entry_id)) = self.note_ref(extract_object_id(activity), "Announce") {
            self.db.increment_boost_count(&username, entry_id)?;
            info!("boost on {username}/posts/{entry_id}");
        }
        Ok(())
    }

    /// A deleted remote actor disappears from every bot's follower set.
    fn handle_delete(&self, activity: &Value) -> Result<()> {
        let Some(actor) = activity.get("actor").and_then(Value::as_str) else {
            return Ok(());
        };
        let removed = self.db.remove_follower_everywhere(actor)?;
        if removed > 0 {
            info!("removed deleted actor {actor} from {removed} bot(s)");
        }
        Ok(())
    }

    /// Resolves a referenced object URL into `(bot, entry_id)` via our own
    /// note template. Any failure is logged at debug and the event dropped.
    fn note_ref(&self, object_id: Option<&str>, label: &str) -> Option<(String, i64)> {
        let Some(object_id) = object_id else {
            debug!("{label} ignored: missing object id");
            return None;
        };
        let Some((username, entry_id)) = parse_note_uri(&self.cx.base_url, object_id) else {
            debug!("{label} ignored: {object_id} did not resolve to one of our posts");
            return None;
        };
        if !self.config.has_bot(&username) {
            debug!("{label} ignored: unknown bot {username}");
            return None;
        }
        Some((username, entry_id))
    }
}

fn extract_object_id(value: &Value) -> Option<&str> {
    match value.get("object")? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .host_str()
        .map(|h| h.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::federation::testing::{test_context, MockResolver, MockSender};
    use crate::federation::ResolvedActor;
    use crate::feed_db::tests::temp_db;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const BASE: &str = "https://bots.example";

    fn test_config() -> Arc<FeedsConfig> {
        let mut bots = BTreeMap::new();
        bots.insert(
            "news".to_string(),
            BotConfig {
                feed_url: "https://example.com/feed.xml".to_string(),
                display_name: "News".to_string(),
                summary: "News feed".to_string(),
                profile_photo: None,
            },
        );
        Arc::new(FeedsConfig {
            bots,
            follows: vec![],
            relays: vec![],
        })
    }

    fn handler(
        blocked: &[&str],
    ) -> (TempDir, FeedDb, Arc<MockSender>, Arc<MockResolver>, InboxHandler) {
        let (dir, db) = temp_db();
        let (cx, sender, resolver) = test_context(BASE);
        let h = InboxHandler::new(
            cx,
            db.clone(),
            test_config(),
            blocked.iter().map(|s| s.to_string()).collect(),
        );
        (dir, db, sender, resolver, h)
    }

    fn remote_actor(resolver: &MockResolver, id: &str) -> ResolvedActor {
        let actor = ResolvedActor {
            id: id.to_string(),
            inbox: format!("{id}/inbox"),
            shared_inbox: Some("https://remote.example/inbox".to_string()),
        };
        resolver.insert(id, actor.clone());
        actor
    }

    fn follow_activity(actor: &str) -> Value {
        json!({
            "id": format!("{actor}#follow-1"),
            "type": "Follow",
            "actor": actor,
            "object": "https://bots.example/users/news",
        })
    }

    #[tokio::test]
    async fn follow_adds_follower_and_accepts() {
        let (_dir, db, sender, resolver, h) = handler(&[]);
        remote_actor(&resolver, "https://remote.example/u/alice");

        h.handle(&follow_activity("https://remote.example/u/alice"))
            .await
            .unwrap();

        assert_eq!(db.count_followers("news").unwrap(), 1);
        let recips = db.follower_recipients("news").unwrap();
        assert_eq!(recips[0].shared_inbox_url, "https://remote.example/inbox");

        let accepts = sender.sent_of_type("Accept");
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].bot_username, "news");
        assert_eq!(accepts[0].activity["object"]["type"], "Follow");
        assert_eq!(accepts[0].recipients[0].id, "https://remote.example/u/alice");
    }

    #[tokio::test]
    async fn duplicate_follow_keeps_a_single_row() {
        let (_dir, db, sender, resolver, h) = handler(&[]);
        remote_actor(&resolver, "https://remote.example/u/alice");
        let follow = follow_activity("https://remote.example/u/alice");

        h.handle(&follow).await.unwrap();
        h.handle(&follow).await.unwrap();

        assert_eq!(db.count_followers("news").unwrap(), 1);
        assert_eq!(sender.sent_of_type("Accept").len(), 2);
    }

    #[tokio::test]
    async fn blocked_instance_is_rejected() {
        let (_dir, db, sender, resolver, h) = handler(&["evil.example"]);
        remote_actor(&resolver, "https://evil.example/u/mallory");

        h.handle(&follow_activity("https://evil.example/u/mallory"))
            .await
            .unwrap();

        assert_eq!(db.count_followers("news").unwrap(), 0);
        assert!(sender.sent_of_type("Accept").is_empty());
        let rejects = sender.sent_of_type("Reject");
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].recipients[0].id, "https://evil.example/u/mallory");
    }

    #[tokio::test]
    async fn unresolvable_actor_is_ignored() {
        let (_dir, db, _sender, _resolver, h) = handler(&[]);
        h.handle(&follow_activity("https://remote.example/u/ghost"))
            .await
            .unwrap();
        assert_eq!(db.count_followers("news").unwrap(), 0);
    }

    #[tokio::test]
    async fn undo_follow_empties_follower_set() {
        let (_dir, db, _sender, resolver, h) = handler(&[]);
        remote_actor(&resolver, "https://remote.example/u/alice");
        h.handle(&follow_activity("https://remote.example/u/alice"))
            .await
            .unwrap();

        let undo = json!({
            "type": "Undo",
            "actor": "https://remote.example/u/alice",
            "object": {
                "id": "https://remote.example/u/alice#follow-1",
                "type": "Follow",
                "actor": "https://remote.example/u/alice",
                "object": "https://bots.example/users/news",
            },
        });
        h.handle(&undo).await.unwrap();
        assert_eq!(db.count_followers("news").unwrap(), 0);
        // Redelivery is harmless.
        h.handle(&undo).await.unwrap();
        assert_eq!(db.count_followers("news").unwrap(), 0);
    }

    #[tokio::test]
    async fn likes_and_boosts_track_counters() {
        let (_dir, db, _sender, _resolver, h) = handler(&[]);
        let id = db
            .insert_entry("news", "g1", "https://example.com/1", "One", None)
            .unwrap()
            .unwrap();
        let post = format!("https://bots.example/users/news/posts/{id}");

        h.handle(&json!({"type": "Like", "actor": "https://r.example/u", "object": post.clone()}))
            .await
            .unwrap();
        h.handle(&json!({"type": "EmojiReact", "actor": "https://r.example/u", "object": post.clone(), "content": "🦀"}))
            .await
            .unwrap();
        h.handle(&json!({"type": "Announce", "actor": "https://r.example/u", "object": post.clone()}))
            .await
            .unwrap();

        let entry = db.get_entry("news", id).unwrap().unwrap();
        assert_eq!(entry.like_count, 2);
        assert_eq!(entry.boost_count, 1);

        h.handle(&json!({
            "type": "Undo",
            "actor": "https://r.example/u",
            "object": {"type": "Like", "object": post.clone()},
        }))
        .await
        .unwrap();
        h.handle(&json!({
            "type": "Undo",
            "actor": "https://r.example/u",
            "object": {"type": "Announce", "object": post.clone()},
        }))
        .await
        .unwrap();

        let entry = db.get_entry("news", id).unwrap().unwrap();
        assert_eq!(entry.like_count, 1);
        assert_eq!(entry.boost_count, 0);

        // Another Undo(Announce) floors at zero instead of going negative.
        h.handle(&json!({
            "type": "Undo",
            "actor": "https://r.example/u",
            "object": {"type": "Announce", "object": post.clone()},
        }))
        .await
        .unwrap();
        assert_eq!(db.get_entry("news", id).unwrap().unwrap().boost_count, 0);
    }

    #[tokio::test]
    async fn foreign_or_malformed_references_are_ignored() {
        let (_dir, db, _sender, _resolver, h) = handler(&[]);
        let id = db
            .insert_entry("news", "g1", "https://example.com/1", "One", None)
            .unwrap()
            .unwrap();

        for object in [
            json!("https://other.example/users/news/posts/1"),
            json!("https://bots.example/users/ghost/posts/1"),
            json!("https://bots.example/users/news/posts/abc"),
            json!(42),
        ] {
            h.handle(&json!({"type": "Like", "actor": "https://r.example/u", "object": object}))
                .await
                .unwrap();
        }
        assert_eq!(db.get_entry("news", id).unwrap().unwrap().like_count, 0);
    }

    #[tokio::test]
    async fn accept_and_reject_correlate_sent_follows() {
        let (_dir, db, _sender, _resolver, h) = handler(&[]);
        db.upsert_following(
            "news",
            "admin@social.example",
            "https://social.example/u/admin",
            "https://bots.example/users/news/follows/abc",
        )
        .unwrap();
        db.upsert_relay(
            "https://relay.example/actor",
            "https://relay.example/inbox",
            "https://relay.example/actor",
            "https://bots.example/relay-follows/r1",
        )
        .unwrap();

        h.handle(&json!({
            "type": "Accept",
            "actor": "https://social.example/u/admin",
            "object": {
                "id": "https://bots.example/users/news/follows/abc",
                "type": "Follow",
            },
        }))
        .await
        .unwrap();
        let row = db
            .following_by_activity_id("https://bots.example/users/news/follows/abc")
            .unwrap()
            .unwrap();
        assert_eq!(row.status, RelationshipStatus::Accepted);

        // Relay server echoing only the follow id as a string.
        h.handle(&json!({
            "type": "Reject",
            "actor": "https://relay.example/actor",
            "object": "https://bots.example/relay-follows/r1",
        }))
        .await
        .unwrap();
        let relays = db.all_relays().unwrap();
        assert_eq!(relays[0].status, RelationshipStatus::Rejected);

        // Unknown correlation id is ignored.
        h.handle(&json!({"type": "Accept", "object": "https://bots.example/users/news/follows/nope"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_removes_actor_from_all_bots() {
        let (_dir, db, _sender, _resolver, h) = handler(&[]);
        db.add_follower("news", "https://gone.example/u", "f-1", None).unwrap();

        h.handle(&json!({"type": "Delete", "actor": "https://gone.example/u", "object": "https://gone.example/u"}))
            .await
            .unwrap();
        assert_eq!(db.count_followers("news").unwrap(), 0);

        // Delete without an actor is a no-op.
        h.handle(&json!({"type": "Delete"})).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_activity_types_are_ignored() {
        let (_dir, _db, _sender, _resolver, h) = handler(&[]);
        h.handle(&json!({"type": "Move", "actor": "https://r.example/u"}))
            .await
            .unwrap();
        h.handle(&json!({"no": "type"})).await.unwrap();
    }
}
