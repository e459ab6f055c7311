//! A personal feed aggregator.
//!
//! Subscriptions are imported from OPML, fetched periodically as Atom or RSS,
//! merged into a per-feed history without duplicates and persisted as one
//! JSON document. Unread entries are served over a small HTTP surface.

pub mod config;
pub mod engine;
pub mod feed;
pub mod storage;
pub mod util;
pub mod web;
