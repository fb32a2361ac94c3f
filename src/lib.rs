//! # pagemill
//!
//! A document ingestion pipeline that turns uploaded files into
//! retrieval-sized, reviewable chunks.
//!
//! An upload is stored on disk, rendered to one image per page, and has its
//! text extracted: PDFs page by page through a vision completion service,
//! every other format by normalizing it to Markdown. The text is then split
//! into chunks, either by a completion service or by a deterministic rule
//! splitter, and the chunks go through a confirm/archive review.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Upload  │──▶│ Page images │──▶│  Transcribe  │──▶│  SQLite  │
//! │ (stream) │   │  (parsers)  │   │ / Markdown   │   │          │
//! └──────────┘   └─────────────┘   └──────────────┘   └────┬─────┘
//!                                                          │
//!                                   ┌──────────────┐       │
//!                                   │   Chunkers   │◀──────┘
//!                                   │ semantic/rule│
//!                                   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! pagemill init                          # create database
//! pagemill upload report.pdf             # store, render and transcribe
//! pagemill text <id> --page 2            # read extracted text
//! pagemill chunks auto <id> --chunker rule
//! pagemill chunks confirm <chunk-id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`] | Service wiring |
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and status machines |
//! | [`store`] | SQLite persistence |
//! | [`parsers`] | Per-format page counting, text and page images |
//! | [`markdown`] | Markdown normalization of non-PDF formats |
//! | [`transcribe`] | PDF page transcription |
//! | [`completion`] | Text and vision completion clients |
//! | [`parsing`] | Bounded text extraction per document |
//! | [`documents`] | Document lifecycle |
//! | [`chunk`] | Rule chunker |
//! | [`semantic`] | Completion-driven chunker with fallbacks |
//! | [`chunks`] | Chunk management and auto-chunking |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod chunk;
pub mod chunks;
pub mod clean;
pub mod completion;
pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod markdown;
pub mod migrate;
pub mod models;
pub mod parsers;
pub mod parsing;
pub mod pool;
pub mod progress;
pub mod semantic;
pub mod store;
pub mod transcribe;

pub use error::{Error, Result};
