/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor::{
    actor_uri, build_actor, follow_uri, new_follow_id, relay_follow_uri, AS_CONTEXT,
    SECURITY_CONTEXT,
};
use crate::config::FeedsConfig;
use crate::federation::{FederationContext, Recipient};
use crate::feed_db::{now_ms, FeedDb};
use crate::keys;
use anyhow::Result;
use serde_json::json;
use std::collections::HashSet;
use tracing::{error, info};

/// Startup reconciliation: configured follows, relay subscriptions and
/// profile refreshes. Tasks are independent; a failing one never stops the
/// next.
pub async fn run(cx: &FederationContext, db: &FeedDb, config: &FeedsConfig) {
    if let Err(e) = follow_configured_accounts(cx, db, config).await {
        error!("follow bootstrap failed: {e:#}");
    }
    if let Err(e) = subscribe_to_relays(cx, db, config).await {
        error!("relay bootstrap failed: {e:#}");
    }
    if let Err(e) = send_profile_updates(cx, db, config).await {
        error!("profile update bootstrap failed: {e:#}");
    }
}

/// Sends a Follow from every bot to each configured handle, skipping pairs
/// that were already attempted on a previous start.
pub async fn follow_configured_accounts(
    cx: &FederationContext,
    db: &FeedDb,
    config: &FeedsConfig,
) -> Result<()> {
    if config.follows.is_empty() {
        return Ok(());
    }
    let existing: HashSet<(String, String)> = db
        .all_following()?
        .into_iter()
        .map(|f| (f.bot_username, f.handle))
        .collect();

    for raw_handle in &config.follows {
        let handle = raw_handle.trim_start_matches('@');
        let target = match cx.resolver.resolve_handle(handle).await {
            Ok(t) => t,
            Err(e) => {
                error!("could not resolve {handle}: {e:#}");
                continue;
            }
        };

        for bot_username in config.bots.keys() {
            if existing.contains(&(bot_username.clone(), handle.to_string())) {
                info!("{bot_username} already follows {handle}, skipping");
                continue;
            }

            let follow_id = follow_uri(&cx.base_url, bot_username, &new_follow_id());
            let follow = json!({
                "@context": AS_CONTEXT,
                "id": follow_id.clone(),
                "type": "Follow",
                "actor": actor_uri(&cx.base_url, bot_username),
                "object": target.id.clone(),
            });
            db.upsert_following(bot_username, handle, &target.id, &follow_id)?;

            let recipient = Recipient {
                id: target.id.clone(),
                inbox: target.inbox.clone(),
            };
            match cx.sender.send(bot_username, &[recipient], follow).await {
                Ok(()) => info!("sent follow from {bot_username} to {handle}"),
                Err(e) => error!("failed to follow {handle} from {bot_username}: {e:#}"),
            }
        }
    }
    Ok(())
}

/// Subscribes the deployment (as its first bot) to each configured relay.
/// URLs already present in the relay table are left alone, whatever their
/// status; a rejected relay is only retried after manual removal.
pub async fn subscribe_to_relays(
    cx: &FederationContext,
    db: &FeedDb,
    config: &FeedsConfig,
) -> Result<()> {
    if config.relays.is_empty() {
        return Ok(());
    }
    let Some(subscriber) = config.first_bot_username() else {
        return Ok(());
    };
    let existing: HashSet<String> = db.all_relays()?.into_iter().map(|r| r.url).collect();

    for relay_url in &config.relays {
        if existing.contains(relay_url) {
            info!("relay {relay_url} already tracked, skipping subscription");
            continue;
        }
        let target = match cx.resolver.resolve_url(relay_url).await {
            Ok(t) => t,
            Err(e) => {
                error!("could not resolve relay {relay_url}: {e:#}");
                continue;
            }
        };

        let follow_id = relay_follow_uri(&cx.base_url, &new_follow_id());
        let follow = json!({
            "@context": AS_CONTEXT,
            "id": follow_id.clone(),
            "type": "Follow",
            "actor": actor_uri(&cx.base_url, subscriber),
            "object": target.id.clone(),
        });
        db.upsert_relay(relay_url, &target.inbox, &target.id, &follow_id)?;

        let recipient = Recipient {
            id: target.id.clone(),
            inbox: target.inbox.clone(),
        };
        match cx.sender.send(subscriber, &[recipient], follow).await {
            Ok(()) => info!("sent follow to relay {relay_url} from {subscriber}"),
            Err(e) => error!("failed to subscribe to relay {relay_url}: {e:#}"),
        }
    }
    Ok(())
}

/// Re-broadcasts each bot's actor document as an Update so remote caches
/// pick up profile changes.
pub async fn send_profile_updates(
    cx: &FederationContext,
    db: &FeedDb,
    config: &FeedsConfig,
) -> Result<()> {
    for (username, bot) in &config.bots {
        if let Err(e) = update_profile(cx, db, username, bot).await {
            error!("profile update for {username} failed: {e:#}");
        }
    }
    Ok(())
}

async fn update_profile(
    cx: &FederationContext,
    db: &FeedDb,
    username: &str,
    bot: &crate::config::BotConfig,
) -> Result<()> {
    let followers = db.follower_recipients(username)?;
    if followers.is_empty() {
        info!("skipping profile update for {username}: no follower with a shared inbox");
        return Ok(());
    }

    let pairs = keys::get_key_pairs(db, username)?;
    let actor = build_actor(&cx.base_url, username, bot, &pairs)?;
    let me = actor_uri(&cx.base_url, username);
    let update = json!({
        "@context": [AS_CONTEXT, SECURITY_CONTEXT],
        "id": format!("{me}#profile-update-{}", now_ms()),
        "type": "Update",
        "actor": me,
        "to": followers.iter().map(|f| f.follower_id.clone()).collect::<Vec<_>>(),
        "object": serde_json::to_value(&actor)?,
    });

    let recipients: Vec<Recipient> = followers
        .into_iter()
        .map(|f| Recipient {
            id: f.follower_id,
            inbox: f.shared_inbox_url,
        })
        .collect();
    cx.sender.send(username, &recipients, update).await?;
    info!(
        "sent profile update for {username} to {} follower(s)",
        recipients.len()
    );
    Ok(())
}
