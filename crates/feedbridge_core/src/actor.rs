/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::BotConfig;
use crate::keys::{self, KeyPair};
use crate::publisher::escape_html;
use anyhow::Result;
use serde::Serialize;

pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

pub fn actor_uri(base_url: &str, username: &str) -> String {
    format!("{}/users/{username}", base_url.trim_end_matches('/'))
}

pub fn inbox_uri(base_url: &str, username: &str) -> String {
    format!("{}/inbox", actor_uri(base_url, username))
}

pub fn shared_inbox_uri(base_url: &str) -> String {
    format!("{}/inbox", base_url.trim_end_matches('/'))
}

pub fn outbox_uri(base_url: &str, username: &str) -> String {
    format!("{}/outbox", actor_uri(base_url, username))
}

pub fn followers_uri(base_url: &str, username: &str) -> String {
    format!("{}/followers", actor_uri(base_url, username))
}

/// Note ids use the internally generated numeric entry id. Feed guids never
/// appear in generated URLs.
pub fn note_uri(base_url: &str, username: &str, entry_id: i64) -> String {
    format!("{}/posts/{entry_id}", actor_uri(base_url, username))
}

pub fn follow_uri(base_url: &str, username: &str, follow_id: &str) -> String {
    format!("{}/follows/{follow_id}", actor_uri(base_url, username))
}

pub fn relay_follow_uri(base_url: &str, follow_id: &str) -> String {
    format!("{}/relay-follows/{follow_id}", base_url.trim_end_matches('/'))
}

/// 32 hex chars from 16 random bytes, used to correlate outgoing Follows.
pub fn new_follow_id() -> String {
    let mut b = [0u8; 16];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    hex::encode(b)
}

/// Strict match against our own note URL template. Returns
/// `(username, entry_id)` or `None` for anything foreign or malformed.
pub fn parse_note_uri(base_url: &str, url: &str) -> Option<(String, i64)> {
    let rest = url.strip_prefix(base_url.trim_end_matches('/'))?;
    let rest = rest.strip_prefix("/users/")?;
    let (username, id_part) = rest.split_once("/posts/")?;
    if username.is_empty() || username.contains('/') {
        return None;
    }
    let id_part = id_part.trim_end_matches('/');
    let entry_id: i64 = id_part.parse().ok()?;
    Some((username.to_string(), entry_id))
}

/// Strict match against our own actor URL template.
pub fn parse_actor_uri(base_url: &str, url: &str) -> Option<String> {
    let rest = url.strip_prefix(base_url.trim_end_matches('/'))?;
    let rest = rest.strip_prefix("/users/")?;
    let username = rest.trim_end_matches('/');
    if username.is_empty() || username.contains('/') {
        return None;
    }
    Some(username.to_string())
}

#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
pub struct Actor {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub preferredUsername: String,
    pub name: String,
    pub summary: String,
    pub url: String,
    pub inbox: String,
    pub outbox: String,
    pub followers: String,
    pub endpoints: ActorEndpoints,
    pub publicKey: ActorPublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<ActorImage>,
}

#[derive(Debug, Serialize)]
pub struct ActorEndpoints {
    #[serde(rename = "sharedInbox")]
    pub shared_inbox: String,
}

#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
pub struct ActorPublicKey {
    pub id: String,
    pub owner: String,
    pub publicKeyPem: String,
}

#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
pub struct ActorImage {
    #[serde(rename = "type")]
    pub ty: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mediaType: Option<&'static str>,
    pub url: String,
}

fn icon_media_type(photo_url: &str) -> Option<&'static str> {
    let url = reqwest::Url::parse(photo_url).ok()?;
    let ext = url.path().rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}

/// The public actor representation: pure data computed from configuration
/// plus the stored key pairs.
pub fn build_actor(
    base_url: &str,
    username: &str,
    bot: &BotConfig,
    pairs: &[KeyPair],
) -> Result<Actor> {
    let id = actor_uri(base_url, username);
    let summary = format!(
        "<p>{}</p><p>I am a bot that mirrors an RSS feed. Source: <a href=\"{}\">{}</a></p>",
        escape_html(&bot.summary),
        escape_html(&bot.feed_url),
        escape_html(&bot.feed_url),
    );
    let icon = bot.profile_photo.as_ref().map(|photo| ActorImage {
        ty: "Image",
        mediaType: icon_media_type(photo),
        url: photo.clone(),
    });
    Ok(Actor {
        context: vec![AS_CONTEXT.to_string(), SECURITY_CONTEXT.to_string()],
        id: id.clone(),
        ty: "Application".to_string(),
        preferredUsername: username.to_string(),
        name: bot.display_name.clone(),
        summary,
        url: format!("{}/@{username}", base_url.trim_end_matches('/')),
        inbox: inbox_uri(base_url, username),
        outbox: outbox_uri(base_url, username),
        followers: followers_uri(base_url, username),
        endpoints: ActorEndpoints {
            shared_inbox: shared_inbox_uri(base_url),
        },
        publicKey: ActorPublicKey {
            id: format!("{id}#main-key"),
            owner: id,
            publicKeyPem: keys::rsa_public_key_pem(pairs)?,
        },
        icon,
    })
}
