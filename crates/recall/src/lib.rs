//! Recall - caching and write batching for conversational memory
//!
//! This crate sits in front of a persistent memory store and keeps reads
//! fast with a two-tier cache, coalesces identical concurrent reads into a
//! single fetch, batches writes into bulk upserts, and ranks memories by
//! recency, access frequency and importance.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dedup;
pub mod error;
pub mod memory;
pub mod service;
pub mod storage;
pub mod testing;

pub use error::{RecallError, Result};
pub use service::MemoryService;
