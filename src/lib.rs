#![cfg_attr(docsrs, feature(doc_cfg))]
//! # ubms_lib
//!
//! Decoder and pack aggregator for the CAN protocol spoken by Valence U-BMS
//! battery management units.
//!
//! Raw frames go into a [`Bridge`], which classifies and decodes them, keeps
//! the last value of every field group per module in a [`registry::ModuleRegistry`],
//! and on every [`Bridge::tick`] combines the modules along the configured
//! series/parallel [`topology::PackTopology`] into a [`state::PackState`]
//! with alarms and staleness flags.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, used to compile the `ubms` command-line tool.
//! - `tokio-runtime`: Async ingestion and aggregation loops in [`runtime`].
//! - `bin-dependencies`: Everything the `ubms` binary needs, including `tokio-runtime`.

/// Contains error types for the library.
mod error;
/// Frame identifiers and payload decoders.
pub mod protocol;

pub mod aggregate;
pub mod alarms;
pub mod bridge;
pub mod candump;
pub mod config;
pub mod registry;
pub mod state;
pub mod topology;

pub use bridge::{Bridge, FrameStatistics};
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use state::PackState;

/// Async loops driving a shared [`Bridge`].
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-runtime")))]
#[cfg(feature = "tokio-runtime")]
pub mod runtime;
