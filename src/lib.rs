//! # Capture Harness
//!
//! A personal knowledge-capture backend: highlights of source documents,
//! feed items pulled from RSS/Atom subscriptions, and hybrid search over
//! both, all in one SQLite file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌───────────┐
//! │  Feeds   │──▶│ Ingest: fetch, parse,     │──▶│  SQLite   │
//! │ RSS/Atom │   │ dedup, extract, enrich    │   │ FTS5+Vec  │
//! └──────────┘   └───────────────────────────┘   └─────┬─────┘
//!                            ┌──────────┐              │
//!                            │  Index   │◀─────────────┤
//!                            │ (embed)  │              │
//!                            └──────────┘              ▼
//!                                      ┌──────────────────────────┐
//!                                      │ Search: text + vector,   │
//!                                      │ reciprocal rank fusion   │
//!                                      └────────────┬─────────────┘
//!                                         ┌─────────┴─────────┐
//!                                         ▼                   ▼
//!                                    ┌─────────┐        ┌──────────┐
//!                                    │   CLI   │        │   HTTP   │
//!                                    │  (cap)  │        │  (axum)  │
//!                                    └─────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cap init
//! cap feed add https://example.com/feed.xml
//! cap sync
//! cap index                     # requires [embedding]
//! cap search "rust async"
//! cap serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors of the pipeline and engine |
//! | [`db`] / [`migrate`] | Database connection and schema |
//! | [`store`] | Storage trait and SQLite backend |
//! | [`dedup`] | Identity canonicalisation and dedup keys |
//! | [`fetch`] | Conditional HTTP fetching |
//! | [`parse`] | RSS/Atom parsing |
//! | [`extract`] | HTML to plain text |
//! | [`enrich`] | Summaries and tags via a local LLM |
//! | [`ingest`] | Feed ingestion pipeline |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Embedding stage, `processed -> indexed` |
//! | [`similarity`] | Trigram similarity |
//! | [`search`] | Hybrid retrieval engine |
//! | [`scheduler`] | Periodic feed polling |
//! | [`feeds`] | Feed management and capture commands |
//! | [`stats`] | Database statistics |
//! | [`server`] | HTTP server |

pub mod config;
pub mod db;
pub mod dedup;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod feeds;
pub mod fetch;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod similarity;
pub mod stats;
pub mod store;
