/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor::{actor_uri, followers_uri, note_uri, AS_CONTEXT, PUBLIC_COLLECTION};
use crate::federation::{FederationContext, Recipient};
use crate::feed::FeedEntry;
use crate::feed_db::FeedDb;
use anyhow::Result;
use chrono::{DateTime, SecondsFormat};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Bounds against pathological upstream feeds, applied before anything
/// touches storage or the wire.
pub const MAX_GUID_LEN: usize = 2048;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_TITLE_LEN: usize = 2000;

const FANOUT_CONCURRENCY: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub published: u32,
    pub skipped: u32,
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Accepts only absolute http/https URLs; everything else (javascript:,
/// data:, relative paths, garbage) is treated as no URL at all.
pub fn safe_parse_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = reqwest::Url::parse(trimmed).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url.to_string()),
        _ => None,
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// `<p>{title}</p>` plus a link paragraph only when the link survives
/// `safe_parse_url`. All text is entity-escaped.
pub fn format_content(title: &str, link: &str) -> String {
    let mut out = format!("<p>{}</p>", escape_html(title));
    if let Some(url) = safe_parse_url(link) {
        let escaped = escape_html(&url);
        out.push_str(&format!("<p><a href=\"{escaped}\">{escaped}</a></p>"));
    }
    out
}

fn rfc3339(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms).map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// The outbound Create(Note). The note id derives from the internally
/// generated numeric entry id; feed data only ever appears in the content.
pub fn build_create_activity(
    base_url: &str,
    bot_username: &str,
    entry_id: i64,
    title: &str,
    link: &str,
    published_at_ms: Option<i64>,
) -> Value {
    let note_id = note_uri(base_url, bot_username, entry_id);
    let actor_id = actor_uri(base_url, bot_username);
    let followers = followers_uri(base_url, bot_username);
    let published = published_at_ms.and_then(rfc3339);

    let mut note = json!({
        "id": note_id.clone(),
        "type": "Note",
        "attributedTo": actor_id.clone(),
        "content": format_content(title, link),
        "mediaType": "text/html",
        "to": [PUBLIC_COLLECTION],
        "cc": [followers.clone()],
    });
    if let Some(url) = safe_parse_url(link) {
        note["url"] = json!(url);
    }
    if let Some(ts) = &published {
        note["published"] = json!(ts);
    }

    let mut create = json!({
        "@context": AS_CONTEXT,
        "id": format!("{note_id}#activity"),
        "type": "Create",
        "actor": actor_id,
        "to": [PUBLIC_COLLECTION],
        "cc": [followers],
        "object": note,
    });
    if let Some(ts) = published {
        create["published"] = json!(ts);
    }
    create
}

/// Active followers with a shared inbox plus accepted relays.
fn current_recipients(db: &FeedDb, bot_username: &str) -> Result<Vec<Recipient>> {
    let mut out = Vec::new();
    for f in db.follower_recipients(bot_username)? {
        out.push(Recipient {
            id: f.follower_id,
            inbox: f.shared_inbox_url,
        });
    }
    for relay in db.accepted_relays()? {
        let Some(inbox) = relay.inbox_url else {
            continue;
        };
        out.push(Recipient {
            id: relay.actor_id.unwrap_or_else(|| relay.url.clone()),
            inbox,
        });
    }
    Ok(out)
}

/// Deduplicates `entries` against storage and fans new ones out to the
/// current recipient set, in feed order.
pub async fn publish_new_entries(
    cx: &FederationContext,
    db: &FeedDb,
    bot_username: &str,
    entries: &[FeedEntry],
) -> Result<PublishOutcome> {
    let mut outcome = PublishOutcome::default();
    let recipients = current_recipients(db, bot_username)?;

    for entry in entries {
        let guid = truncate_chars(&entry.guid, MAX_GUID_LEN);
        let link = truncate_chars(&entry.link, MAX_URL_LEN);
        let title = truncate_chars(&entry.title, MAX_TITLE_LEN);

        let entry_id = match db.insert_entry(
            bot_username,
            &guid,
            &link,
            &title,
            entry.published_at_ms,
        )? {
            Some(id) => id,
            None => {
                // Seen before; never re-send.
                outcome.skipped += 1;
                continue;
            }
        };

        if recipients.is_empty() {
            // Recorded for the outbox, but nothing to push to.
            outcome.skipped += 1;
            continue;
        }

        let activity = build_create_activity(
            &cx.base_url,
            bot_username,
            entry_id,
            &title,
            &link,
            entry.published_at_ms,
        );
        fan_out(cx, bot_username, &recipients, &activity).await;
        outcome.published += 1;
        info!(
            "[{bot_username}] published entry {entry_id} to {} recipient(s)",
            recipients.len()
        );
    }

    Ok(outcome)
}

/// Per-recipient isolated delivery: one failure is logged and neither aborts
/// the batch nor un-publishes the entry. Retry is the delivery runtime's
/// business, not ours.
async fn fan_out(
    cx: &FederationContext,
    bot_username: &str,
    recipients: &[Recipient],
    activity: &Value,
) {
    let results: Vec<(String, Result<()>)> = stream::iter(recipients.iter().cloned().map(|r| {
        let sender = cx.sender.clone();
        let activity = activity.clone();
        let bot = bot_username.to_string();
        async move {
            let outcome = sender.send(&bot, std::slice::from_ref(&r), activity).await;
            (r.id, outcome)
        }
    }))
    .buffer_unordered(FANOUT_CONCURRENCY)
    .collect()
    .await;

    for (recipient, outcome) in results {
        if let Err(e) = outcome {
            warn!("[{bot_username}] delivery to {recipient} failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::testing::test_context;
    use crate::feed_db::tests::temp_db;

    const BASE: &str = "https://bots.example";

    fn entry(guid: &str, title: &str, link: &str) -> FeedEntry {
        FeedEntry {
            guid: guid.to_string(),
            title: title.to_string(),
            link: link.to_string(),
            published_at_ms: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn safe_parse_url_allows_http_schemes_only() {
        assert!(safe_parse_url("https://example.com/a").is_some());
        assert!(safe_parse_url("http://example.com/a").is_some());
        assert_eq!(safe_parse_url("javascript:alert(1)"), None);
        assert_eq!(safe_parse_url("data:text/html,hi"), None);
        assert_eq!(safe_parse_url("vbscript:msgbox"), None);
        assert_eq!(safe_parse_url("ftp://example.com/a"), None);
        assert_eq!(safe_parse_url("/relative/path"), None);
        assert_eq!(safe_parse_url("not a url"), None);
        assert_eq!(safe_parse_url(""), None);
    }

    #[test]
    fn escapes_every_dangerous_character() {
        let rendered = format_content("Say \"hello\" <script>", "https://example.com/x?a=1&b=2");
        assert!(rendered.contains("&quot;hello&quot;"));
        assert!(rendered.contains("&lt;script&gt;"));
        assert!(rendered.contains("a=1&amp;b=2"));
        assert!(!rendered.contains("<script>"));
        assert_eq!(escape_html("it's"), "it&#39;s");
    }

    #[test]
    fn link_paragraph_is_omitted_for_unsafe_urls() {
        assert_eq!(format_content("T", "javascript:alert(1)"), "<p>T</p>");
        assert_eq!(format_content("T", ""), "<p>T</p>");
        assert!(format_content("T", "https://example.com/").contains("<a href="));
    }

    #[test]
    fn truncate_is_exact() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 5), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // Character count, not bytes.
        assert_eq!(truncate_chars("ééééé", 3), "ééé");
    }

    #[test]
    fn note_id_uses_entry_id_never_guid() {
        let activity = build_create_activity(BASE, "news", 17, "Title", "https://example.com/p", None);
        assert_eq!(
            activity["object"]["id"],
            "https://bots.example/users/news/posts/17"
        );
        assert_eq!(
            activity["id"],
            "https://bots.example/users/news/posts/17#activity"
        );
        assert_eq!(activity["object"]["mediaType"], "text/html");
        assert_eq!(activity["to"][0], PUBLIC_COLLECTION);
    }

    #[tokio::test]
    async fn entries_without_recipients_are_stored_but_skipped() {
        let (_dir, db) = temp_db();
        let (cx, sender, _resolver) = test_context(BASE);
        let entries = vec![
            entry("g1", "One", "https://example.com/1"),
            entry("g2", "Two", "https://example.com/2"),
            entry("g3", "Three", ""),
        ];
        let outcome = publish_new_entries(&cx, &db, "news", &entries).await.unwrap();
        assert_eq!(outcome, PublishOutcome { published: 0, skipped: 3 });
        assert_eq!(db.count_entries("news").unwrap(), 3);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicate_guids_are_skipped_and_never_resent() {
        let (_dir, db) = temp_db();
        let (cx, sender, _resolver) = test_context(BASE);
        db.add_follower("news", "https://remote.example/u/1", "f-1", Some("https://remote.example/inbox"))
            .unwrap();

        let entries = vec![entry("g1", "One", "https://example.com/1")];
        let first = publish_new_entries(&cx, &db, "news", &entries).await.unwrap();
        assert_eq!(first, PublishOutcome { published: 1, skipped: 0 });
        assert_eq!(sender.sent().len(), 1);

        let second = publish_new_entries(&cx, &db, "news", &entries).await.unwrap();
        assert_eq!(second, PublishOutcome { published: 0, skipped: 1 });
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn one_failing_recipient_does_not_stop_the_other() {
        let (_dir, db) = temp_db();
        let (cx, sender, _resolver) = test_context(BASE);
        db.add_follower("news", "https://a.example/u", "f-a", Some("https://a.example/inbox"))
            .unwrap();
        db.add_follower("news", "https://b.example/u", "f-b", Some("https://b.example/inbox"))
            .unwrap();
        sender.fail_inbox("https://a.example/inbox");

        let outcome = publish_new_entries(&cx, &db, "news", &[entry("g1", "One", "https://example.com/1")])
            .await
            .unwrap();
        // Dispatch was attempted, so the entry counts as published.
        assert_eq!(outcome, PublishOutcome { published: 1, skipped: 0 });

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        let inboxes: Vec<_> = sent.iter().map(|s| s.recipients[0].inbox.clone()).collect();
        assert!(inboxes.contains(&"https://a.example/inbox".to_string()));
        assert!(inboxes.contains(&"https://b.example/inbox".to_string()));
    }

    #[tokio::test]
    async fn accepted_relays_receive_entries() {
        let (_dir, db) = temp_db();
        let (cx, sender, _resolver) = test_context(BASE);
        db.upsert_relay(
            "https://relay.example/actor",
            "https://relay.example/inbox",
            "https://relay.example/actor",
            "https://bots.example/relay-follows/r1",
        )
        .unwrap();
        // Pending relay: not a recipient yet.
        let outcome = publish_new_entries(&cx, &db, "news", &[entry("g1", "One", "https://example.com/1")])
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome { published: 0, skipped: 1 });

        db.set_relay_status(
            "https://bots.example/relay-follows/r1",
            crate::feed_db::RelationshipStatus::Accepted,
        )
        .unwrap();
        let outcome = publish_new_entries(&cx, &db, "news", &[entry("g2", "Two", "https://example.com/2")])
            .await
            .unwrap();
        assert_eq!(outcome, PublishOutcome { published: 1, skipped: 0 });
        assert_eq!(sender.sent()[0].recipients[0].inbox, "https://relay.example/inbox");
    }

    #[tokio::test]
    async fn oversized_fields_are_truncated_before_storage() {
        let (_dir, db) = temp_db();
        let (cx, _sender, _resolver) = test_context(BASE);
        let long_title = "t".repeat(MAX_TITLE_LEN + 50);
        let long_guid = "g".repeat(MAX_GUID_LEN + 50);
        publish_new_entries(
            &cx,
            &db,
            "news",
            &[entry(&long_guid, &long_title, "https://example.com/1")],
        )
        .await
        .unwrap();
        let stored = &db.list_entries_page("news", 10, 0).unwrap()[0];
        assert_eq!(stored.title.chars().count(), MAX_TITLE_LEN);
        assert_eq!(stored.guid.chars().count(), MAX_GUID_LEN);
    }
}
