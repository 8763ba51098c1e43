/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::feed_db::FeedDb;
use crate::publisher::build_create_activity;
use anyhow::Result;
use serde_json::Value;

pub const OUTBOX_PAGE_SIZE: u32 = 20;

/// One page of a bot's outbox: reverse-chronological Create activities with
/// numeric offset cursors.
#[derive(Debug)]
pub struct OutboxPage {
    pub total: u64,
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
    pub prev_cursor: Option<String>,
}

/// Collection-level metadata for the unpaged view.
#[derive(Debug)]
pub struct OutboxMeta {
    pub total: u64,
    pub first_cursor: Option<String>,
    pub last_cursor: Option<String>,
}

pub fn outbox_page(
    db: &FeedDb,
    base_url: &str,
    username: &str,
    cursor: Option<&str>,
) -> Result<OutboxPage> {
    let offset = cursor.and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
    let total = db.count_entries(username)?;
    let entries = db.list_entries_page(username, OUTBOX_PAGE_SIZE, offset)?;

    let items = entries
        .iter()
        .map(|e| {
            build_create_activity(
                base_url,
                username,
                e.id,
                &e.title,
                &e.url,
                e.published_at_ms,
            )
        })
        .collect::<Vec<_>>();

    let next_offset = offset + items.len() as u64;
    let next_cursor = (next_offset < total).then(|| next_offset.to_string());
    let prev_cursor =
        (offset > 0).then(|| offset.saturating_sub(OUTBOX_PAGE_SIZE as u64).to_string());

    Ok(OutboxPage {
        total,
        items,
        next_cursor,
        prev_cursor,
    })
}

pub fn collection_meta(db: &FeedDb, username: &str) -> Result<OutboxMeta> {
    let total = db.count_entries(username)?;
    let last_cursor = (total > 0).then(|| {
        let last_offset = ((total - 1) / OUTBOX_PAGE_SIZE as u64) * OUTBOX_PAGE_SIZE as u64;
        last_offset.to_string()
    });
    Ok(OutboxMeta {
        total,
        first_cursor: Some("0".to_string()),
        last_cursor,
    })
}
