/*
 * SPDX-FileCopyrightText: 2026 FeedBridge Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod actor;
pub mod bootstrap;
pub mod config;
pub mod federation;
pub mod feed;
pub mod feed_db;
pub mod inbox;
pub mod keys;
pub mod outbox;
pub mod poller;
pub mod publisher;
pub mod runtime;
