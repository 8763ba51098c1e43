/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use chrono::DateTime;
use tracing::debug;

/// Hard ceiling per fetch; some feeds return their entire history.
pub const MAX_FEED_ITEMS: usize = 100;

const UNTITLED: &str = "(untitled)";

/// One normalized feed item. `guid` is the dedupe key and never appears in
/// generated URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub published_at_ms: Option<i64>,
}

pub async fn fetch_feed(client: &reqwest::Client, feed_url: &str) -> Result<Vec<FeedEntry>> {
    let resp = client
        .get(feed_url)
        .send()
        .await
        .with_context(|| format!("fetch feed: {feed_url}"))?
        .error_for_status()
        .with_context(|| format!("feed not ok: {feed_url}"))?;
    let bytes = resp
        .bytes()
        .await
        .with_context(|| format!("read feed body: {feed_url}"))?;
    parse_feed(&bytes).with_context(|| format!("parse feed: {feed_url}"))
}

/// Parses RSS 2.0 and Atom uniformly into the canonical entry shape.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<FeedEntry>> {
    match rss::Channel::read_from(bytes) {
        Ok(channel) => Ok(channel
            .items()
            .iter()
            .take(MAX_FEED_ITEMS)
            .map(normalize_rss_item)
            .collect()),
        Err(rss_err) => {
            let feed = atom_syndication::Feed::read_from(bytes)
                .map_err(|atom_err| {
                    debug!("not RSS 2.0 either: {rss_err}");
                    atom_err
                })
                .context("neither RSS 2.0 nor Atom")?;
            Ok(feed
                .entries()
                .iter()
                .take(MAX_FEED_ITEMS)
                .map(normalize_atom_entry)
                .collect())
        }
    }
}

fn normalize_rss_item(item: &rss::Item) -> FeedEntry {
    let link = item.link().unwrap_or_default().to_string();
    let title = item.title().unwrap_or_default().to_string();
    let guid = first_non_empty(&[
        item.guid().map(|g| g.value()).unwrap_or_default(),
        &link,
        &title,
    ]);
    FeedEntry {
        guid,
        title: or_untitled(title),
        link,
        published_at_ms: item.pub_date().and_then(parse_date),
    }
}

fn normalize_atom_entry(entry: &atom_syndication::Entry) -> FeedEntry {
    let link = entry
        .links()
        .iter()
        .find(|l| l.rel() == "alternate")
        .or_else(|| entry.links().first())
        .map(|l| l.href().to_string())
        .unwrap_or_default();
    let title = entry.title().value.clone();
    let guid = first_non_empty(&[entry.id(), &link, &title]);
    let published_at_ms = entry
        .published()
        .map(|t| t.timestamp_millis())
        .or_else(|| Some(entry.updated().timestamp_millis()));
    FeedEntry {
        guid,
        title: or_untitled(title),
        link,
        published_at_ms,
    }
}

fn first_non_empty(candidates: &[&str]) -> String {
    candidates
        .iter()
        .find(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

fn or_untitled(title: String) -> String {
    if title.trim().is_empty() {
        UNTITLED.to_string()
    } else {
        title
    }
}

fn parse_date(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|t| t.timestamp_millis())
        .ok()
}
