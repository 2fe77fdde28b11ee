//! # Giles
//!
//! Giles is an archiver that sits in front of a time-series engine and a
//! metadata store. Clients push sMAP messages (readings plus descriptive tags)
//! through one of several frontends; Giles coalesces the readings into large
//! per-stream batches before writing them to the engine, keeps the tags
//! queryable, and lets clients subscribe to live readings of every stream that
//! matches a query.
//!
//! ## Features
//!
//! - Coalesced ingest with size and age bounds
//! - A small query language over tags and data ranges
//! - Continuous queries that follow metadata changes
//! - HTTP, WebSocket, newline-delimited TCP and MQTT frontends
//!
//! ## Example
//!
//! ```rust,no_run
//! use giles::archiver::{Archiver, ArchiverOptions};
//! use giles::metadata::MemoryMetadataStore;
//! use giles::tsengine::MemoryTimeseries;
//! use std::sync::Arc;
//!
//! # async fn example() -> giles::Result<()> {
//! let archiver = Archiver::new(
//!     Arc::new(MemoryMetadataStore::new()),
//!     Arc::new(MemoryTimeseries::new()),
//!     ArchiverOptions::default(),
//! )?;
//! let response = archiver.handle_query("select * where has Metadata/Room").await?;
//! println!("{}", response.to_json());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::unnecessary_map_or)]
#![allow(clippy::too_many_lines)]

/// Core data structures and types
pub mod core;

/// Error types
pub mod error;

/// Bounded, self-healing connection pool
pub mod pool;

/// Time-series engine clients
pub mod tsengine;

/// Per-stream write coalescing
pub mod coalescer;

/// Query language parser
pub mod querylang;

/// Metadata store interface and the in-process store
pub mod metadata;

/// Continuous-query broker
pub mod broker;

/// The archiver façade
pub mod archiver;

pub mod config;

pub mod frontends;

pub mod logging;

pub use archiver::{Archiver, ArchiverOptions, QueryResponse};
pub use error::{GilesError, Result};
