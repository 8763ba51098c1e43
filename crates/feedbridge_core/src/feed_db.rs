/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Storage handle for all bot state. Cheap to clone; every method opens a
/// short-lived connection so concurrent tasks never share one.
#[derive(Clone)]
pub struct FeedDb {
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FeedEntry {
    pub id: i64,
    pub bot_username: String,
    pub guid: String,
    pub url: String,
    pub title: String,
    pub published_at_ms: Option<i64>,
    pub like_count: i64,
    pub boost_count: i64,
}

#[derive(Debug, Clone)]
pub struct FollowerRecipient {
    pub follower_id: String,
    pub shared_inbox_url: String,
}

#[derive(Debug, Clone)]
pub struct FollowingRow {
    pub bot_username: String,
    pub handle: String,
    pub target_actor_id: Option<String>,
    pub follow_activity_id: Option<String>,
    pub status: RelationshipStatus,
}

#[derive(Debug, Clone)]
pub struct RelayRow {
    pub url: String,
    pub inbox_url: Option<String>,
    pub actor_id: Option<String>,
    pub status: RelationshipStatus,
    pub follow_activity_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipStatus {
    Pending,
    Accepted,
    Rejected,
}

impl RelationshipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl FeedDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn =
            Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS feed_entries (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_username TEXT NOT NULL,
              guid TEXT NOT NULL,
              url TEXT NOT NULL,
              title TEXT NOT NULL,
              published_at_ms INTEGER NULL,
              created_at_ms INTEGER NOT NULL,
              like_count INTEGER NOT NULL DEFAULT 0,
              boost_count INTEGER NOT NULL DEFAULT 0,
              deleted_at_ms INTEGER NULL,
              UNIQUE(bot_username, guid)
            );
            CREATE INDEX IF NOT EXISTS idx_entries_bot ON feed_entries(bot_username, id DESC);

            CREATE TABLE IF NOT EXISTS actor_keypairs (
              bot_username TEXT PRIMARY KEY,
              keys_json TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS followers (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_username TEXT NOT NULL,
              follower_id TEXT NOT NULL,
              follow_activity_id TEXT NOT NULL,
              shared_inbox_url TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              deleted_at_ms INTEGER NULL,
              UNIQUE(bot_username, follower_id)
            );

            CREATE TABLE IF NOT EXISTS following (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              bot_username TEXT NOT NULL,
              handle TEXT NOT NULL,
              target_actor_id TEXT NULL,
              follow_activity_id TEXT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              created_at_ms INTEGER NOT NULL,
              deleted_at_ms INTEGER NULL,
              UNIQUE(bot_username, handle)
            );

            CREATE TABLE IF NOT EXISTS relays (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              url TEXT NOT NULL UNIQUE,
              inbox_url TEXT NULL,
              actor_id TEXT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              follow_activity_id TEXT NULL,
              created_at_ms INTEGER NOT NULL,
              deleted_at_ms INTEGER NULL
            );
            "#,
        )
        .context("init db schema")?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- feed entries ---

    /// Insert-or-ignore keyed on `(bot_username, guid)`. Returns the new row
    /// id when this call created the entry, `None` when the guid was already
    /// present (first writer wins).
    pub fn insert_entry(
        &self,
        bot_username: &str,
        guid: &str,
        url: &str,
        title: &str,
        published_at_ms: Option<i64>,
    ) -> Result<Option<i64>> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO feed_entries(bot_username, guid, url, title, published_at_ms, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![bot_username, guid, url, title, published_at_ms, now_ms()],
        )?;
        if conn.changes() == 0 {
            return Ok(None);
        }
        Ok(Some(conn.last_insert_rowid()))
    }

    pub fn get_entry(&self, bot_username: &str, entry_id: i64) -> Result<Option<FeedEntry>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            r#"
            SELECT id, bot_username, guid, url, title, published_at_ms, like_count, boost_count
            FROM feed_entries
            WHERE bot_username=?1 AND id=?2 AND deleted_at_ms IS NULL
            "#,
            params![bot_username, entry_id],
            entry_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Entries for a bot, newest first, offset-paginated.
    pub fn list_entries_page(
        &self,
        bot_username: &str,
        limit: u32,
        offset: u64,
    ) -> Result<Vec<FeedEntry>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, bot_username, guid, url, title, published_at_ms, like_count, boost_count
            FROM feed_entries
            WHERE bot_username=?1 AND deleted_at_ms IS NULL
            ORDER BY id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )?;
        let rows = stmt
            .query_map(
                params![bot_username, limit as i64, offset as i64],
                entry_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_entries(&self, bot_username: &str) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM feed_entries WHERE bot_username=?1 AND deleted_at_ms IS NULL",
            params![bot_username],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    pub fn increment_like_count(&self, bot_username: &str, entry_id: i64) -> Result<()> {
        self.bump_counter(bot_username, entry_id, "like_count", 1)
    }

    pub fn decrement_like_count(&self, bot_username: &str, entry_id: i64) -> Result<()> {
        self.bump_counter(bot_username, entry_id, "like_count", -1)
    }

    pub fn increment_boost_count(&self, bot_username: &str, entry_id: i64) -> Result<()> {
        self.bump_counter(bot_username, entry_id, "boost_count", 1)
    }

    pub fn decrement_boost_count(&self, bot_username: &str, entry_id: i64) -> Result<()> {
        self.bump_counter(bot_username, entry_id, "boost_count", -1)
    }

    fn bump_counter(
        &self,
        bot_username: &str,
        entry_id: i64,
        column: &str,
        delta: i64,
    ) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        // Floored at zero so redelivered Undo events cannot go negative.
        conn.execute(
            &format!(
                "UPDATE feed_entries SET {column} = MAX({column} + ?1, 0)
                 WHERE bot_username=?2 AND id=?3 AND deleted_at_ms IS NULL"
            ),
            params![delta, bot_username, entry_id],
        )?;
        Ok(())
    }

    // --- key pairs ---

    pub fn load_keypairs(&self, bot_username: &str) -> Result<Option<String>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            "SELECT keys_json FROM actor_keypairs WHERE bot_username=?1",
            params![bot_username],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn store_keypairs(&self, bot_username: &str, keys_json: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO actor_keypairs(bot_username, keys_json, created_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(bot_username) DO UPDATE SET keys_json=excluded.keys_json
            "#,
            params![bot_username, keys_json, now_ms()],
        )?;
        Ok(())
    }

    // --- followers ---

    /// Upsert keyed on `(bot_username, follower_id)`. A repeated Follow from
    /// the same actor refreshes the correlation id and shared inbox and
    /// revives a soft-deleted row.
    pub fn add_follower(
        &self,
        bot_username: &str,
        follower_id: &str,
        follow_activity_id: &str,
        shared_inbox_url: Option<&str>,
    ) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO followers(bot_username, follower_id, follow_activity_id, shared_inbox_url, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(bot_username, follower_id) DO UPDATE SET
              follow_activity_id=excluded.follow_activity_id,
              shared_inbox_url=excluded.shared_inbox_url,
              deleted_at_ms=NULL
            "#,
            params![bot_username, follower_id, follow_activity_id, shared_inbox_url, now_ms()],
        )?;
        Ok(())
    }

    pub fn remove_follower(&self, bot_username: &str, follower_id: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "UPDATE followers SET deleted_at_ms=?1
             WHERE bot_username=?2 AND follower_id=?3 AND deleted_at_ms IS NULL",
            params![now_ms(), bot_username, follower_id],
        )?;
        Ok(())
    }

    /// Soft-delete the actor from every bot's follower set. Returns how many
    /// rows were affected.
    pub fn remove_follower_everywhere(&self, follower_id: &str) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let changed = conn.execute(
            "UPDATE followers SET deleted_at_ms=?1
             WHERE follower_id=?2 AND deleted_at_ms IS NULL",
            params![now_ms(), follower_id],
        )?;
        Ok(changed as u64)
    }

    pub fn list_followers(&self, bot_username: &str) -> Result<Vec<String>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT follower_id FROM followers
             WHERE bot_username=?1 AND deleted_at_ms IS NULL
             ORDER BY created_at_ms DESC",
        )?;
        let rows = stmt
            .query_map(params![bot_username], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_followers(&self, bot_username: &str) -> Result<u64> {
        let conn = Connection::open(&self.path)?;
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM followers WHERE bot_username=?1 AND deleted_at_ms IS NULL",
            params![bot_username],
            |r| r.get(0),
        )?;
        Ok(total)
    }

    /// Active followers that can actually be delivered to.
    pub fn follower_recipients(&self, bot_username: &str) -> Result<Vec<FollowerRecipient>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT follower_id, shared_inbox_url FROM followers
             WHERE bot_username=?1 AND deleted_at_ms IS NULL AND shared_inbox_url IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![bot_username], |r| {
                Ok(FollowerRecipient {
                    follower_id: r.get(0)?,
                    shared_inbox_url: r.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // --- following ---

    pub fn upsert_following(
        &self,
        bot_username: &str,
        handle: &str,
        target_actor_id: &str,
        follow_activity_id: &str,
    ) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO following(bot_username, handle, target_actor_id, follow_activity_id, status, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            ON CONFLICT(bot_username, handle) DO UPDATE SET
              target_actor_id=excluded.target_actor_id,
              follow_activity_id=excluded.follow_activity_id
            "#,
            params![bot_username, handle, target_actor_id, follow_activity_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn all_following(&self) -> Result<Vec<FollowingRow>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT bot_username, handle, target_actor_id, follow_activity_id, status
             FROM following ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(FollowingRow {
                    bot_username: r.get(0)?,
                    handle: r.get(1)?,
                    target_actor_id: r.get(2)?,
                    follow_activity_id: r.get(3)?,
                    status: RelationshipStatus::from_str(&r.get::<_, String>(4)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn following_by_activity_id(
        &self,
        follow_activity_id: &str,
    ) -> Result<Option<FollowingRow>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            "SELECT bot_username, handle, target_actor_id, follow_activity_id, status
             FROM following WHERE follow_activity_id=?1",
            params![follow_activity_id],
            |r| {
                Ok(FollowingRow {
                    bot_username: r.get(0)?,
                    handle: r.get(1)?,
                    target_actor_id: r.get(2)?,
                    follow_activity_id: r.get(3)?,
                    status: RelationshipStatus::from_str(&r.get::<_, String>(4)?),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Status transition correlated by the Follow we originally sent.
    /// Returns whether a row matched.
    pub fn set_following_status(
        &self,
        follow_activity_id: &str,
        status: RelationshipStatus,
    ) -> Result<bool> {
        let conn = Connection::open(&self.path)?;
        let changed = conn.execute(
            "UPDATE following SET status=?1 WHERE follow_activity_id=?2 AND deleted_at_ms IS NULL",
            params![status.as_str(), follow_activity_id],
        )?;
        Ok(changed > 0)
    }

    // --- relays ---

    pub fn upsert_relay(
        &self,
        url: &str,
        inbox_url: &str,
        actor_id: &str,
        follow_activity_id: &str,
    ) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO relays(url, inbox_url, actor_id, status, follow_activity_id, created_at_ms)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5)
            ON CONFLICT(url) DO UPDATE SET
              inbox_url=excluded.inbox_url,
              actor_id=excluded.actor_id,
              follow_activity_id=excluded.follow_activity_id
            "#,
            params![url, inbox_url, actor_id, follow_activity_id, now_ms()],
        )?;
        Ok(())
    }

    pub fn all_relays(&self) -> Result<Vec<RelayRow>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT url, inbox_url, actor_id, status, follow_activity_id FROM relays ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], relay_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn accepted_relays(&self) -> Result<Vec<RelayRow>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT url, inbox_url, actor_id, status, follow_activity_id
             FROM relays WHERE status='accepted' AND deleted_at_ms IS NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], relay_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_relay_status(
        &self,
        follow_activity_id: &str,
        status: RelationshipStatus,
    ) -> Result<bool> {
        let conn = Connection::open(&self.path)?;
        let changed = conn.execute(
            "UPDATE relays SET status=?1 WHERE follow_activity_id=?2 AND deleted_at_ms IS NULL",
            params![status.as_str(), follow_activity_id],
        )?;
        Ok(changed > 0)
    }
}

fn entry_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FeedEntry> {
    Ok(FeedEntry {
        id: r.get(0)?,
        bot_username: r.get(1)?,
        guid: r.get(2)?,
        url: r.get(3)?,
        title: r.get(4)?,
        published_at_ms: r.get(5)?,
        like_count: r.get(6)?,
        boost_count: r.get(7)?,
    })
}

fn relay_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RelayRow> {
    Ok(RelayRow {
        url: r.get(0)?,
        inbox_url: r.get(1)?,
        actor_id: r.get(2)?,
        status: RelationshipStatus::from_str(&r.get::<_, String>(3)?),
        follow_activity_id: r.get(4)?,
    })
}
