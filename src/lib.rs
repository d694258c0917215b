#![deny(missing_docs)]
//! Oxide Fetch library.
//!
//! Telegram bot that downloads a linked file, optionally extracts it and
//! sends the result back to the chat.

/// Telegram bot layer.
pub mod bot;
/// Configuration management.
pub mod config;
/// Download sessions, registry and progress.
pub mod download;
/// Zip extraction.
pub mod extract;
/// Rate limiting and IP blocklist.
pub mod guard;
/// Log subscriber setup and token redaction.
pub mod logging;
/// End-to-end request coordination.
pub mod pipeline;
/// Fakes for the trait seams, used by tests.
pub mod testing;
/// Byte transfer engines.
pub mod transfer;
/// Delivery of files to the chat.
pub mod upload;
/// Utility functions.
pub mod utils;
/// Per-user working directories.
pub mod workspace;
