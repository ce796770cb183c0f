//! Offline-first client for a paginated story feed.
//!
//! The feed is mirrored into a local SQLite cache: `cache` holds the paging
//! machinery, `api` the HTTP side, and `repository` ties the two together for
//! the command-line front end.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod repository;
