/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const MAX_DISPLAY_NAME_LEN: usize = 100;
const MAX_SUMMARY_LEN: usize = 500;

/// One bot, statically configured. Immutable at runtime.
#[derive(Clone, Debug, Deserialize)]
pub struct BotConfig {
    pub feed_url: String,
    pub display_name: String,
    pub summary: String,
    #[serde(default)]
    pub profile_photo: Option<String>,
}

/// The full deployment configuration: bots keyed by username, plus the
/// accounts every bot should follow and the relays to subscribe to.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FeedsConfig {
    pub bots: BTreeMap<String, BotConfig>,
    #[serde(default)]
    pub follows: Vec<String>,
    #[serde(default)]
    pub relays: Vec<String>,
}

impl FeedsConfig {
    pub fn bot(&self, username: &str) -> Option<&BotConfig> {
        self.bots.get(username)
    }

    pub fn has_bot(&self, username: &str) -> bool {
        self.bots.contains_key(username)
    }

    /// The identity used for deployment-wide actions (relay subscriptions).
    pub fn first_bot_username(&self) -> Option<&str> {
        self.bots.keys().next().map(|s| s.as_str())
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<FeedsConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text)
}

pub fn parse_config(yaml: &str) -> Result<FeedsConfig> {
    let cfg: FeedsConfig = serde_yaml::from_str(yaml).context("parse config yaml")?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn validate_config(cfg: &FeedsConfig) -> Result<()> {
    if cfg.bots.is_empty() {
        bail!("at least one bot must be defined");
    }
    for (username, bot) in &cfg.bots {
        if !is_valid_username(username) {
            bail!("bot username {username:?} must be lowercase alphanumeric or underscore");
        }
        if bot.display_name.is_empty() || bot.display_name.chars().count() > MAX_DISPLAY_NAME_LEN {
            bail!("bot {username}: display_name must be 1..={MAX_DISPLAY_NAME_LEN} characters");
        }
        if bot.summary.is_empty() || bot.summary.chars().count() > MAX_SUMMARY_LEN {
            bail!("bot {username}: summary must be 1..={MAX_SUMMARY_LEN} characters");
        }
        require_http_url(&bot.feed_url)
            .with_context(|| format!("bot {username}: invalid feed_url"))?;
        if let Some(photo) = &bot.profile_photo {
            require_http_url(photo)
                .with_context(|| format!("bot {username}: invalid profile_photo"))?;
        }
    }
    for handle in &cfg.follows {
        if handle.trim_start_matches('@').len() < 3 {
            bail!("follow handle {handle:?} is too short");
        }
    }
    for relay in &cfg.relays {
        require_http_url(relay).with_context(|| format!("invalid relay url {relay:?}"))?;
    }
    Ok(())
}

pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn require_http_url(raw: &str) -> Result<()> {
    let url = reqwest::Url::parse(raw).with_context(|| format!("parse url {raw:?}"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => bail!("unsupported url scheme {other:?}"),
    }
}

/// Instance hostnames whose follow requests are rejected outright.
/// Read from `BLOCKED_INSTANCES` (comma-separated), lowercased.
pub fn blocked_instances_from_env() -> HashSet<String> {
    let raw = match std::env::var("BLOCKED_INSTANCES") {
        Ok(v) => v,
        Err(_) => return HashSet::new(),
    };
    raw.split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}
