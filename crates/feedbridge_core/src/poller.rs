/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::FeedsConfig;
use crate::federation::FederationContext;
use crate::feed::fetch_feed;
use crate::feed_db::FeedDb;
use crate::publisher::publish_new_entries;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

const FEED_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PollerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl PollerHandle {
    /// Signals shutdown and waits for the loop to finish its current cycle.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

/// Periodic poll loop: one pass over all bots per interval, each bot fetched
/// and published serially so dedupe-then-publish ordering holds per bot.
pub fn start(
    cx: Arc<FederationContext>,
    db: FeedDb,
    config: Arc<FeedsConfig>,
    interval: Duration,
) -> PollerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(FEED_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to build feed http client: {e:#}");
                return;
            }
        };
        loop {
            poll_all(&cx, &db, &config, &client).await;
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("poll loop stopped");
    });
    PollerHandle { shutdown_tx, join }
}

async fn poll_all(
    cx: &FederationContext,
    db: &FeedDb,
    config: &FeedsConfig,
    client: &reqwest::Client,
) {
    for (username, bot) in &config.bots {
        // One bot's broken feed never affects the others.
        let entries = match fetch_feed(client, &bot.feed_url).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[{username}] feed fetch failed: {e:#}");
                continue;
            }
        };
        match publish_new_entries(cx, db, username, &entries).await {
            Ok(outcome) if outcome.published > 0 => {
                info!(
                    "[{username}] published {}, skipped {}",
                    outcome.published, outcome.skipped
                );
            }
            Ok(_) => {}
            Err(e) => warn!("[{username}] publish failed: {e:#}"),
        }
    }
}
