//! Output multiplexer
//!
//! [`Output`] owns every target, keyed by a [`TargetId`], and fans the
//! ingested packet flow out to them.
//!
//! # Architecture
//!
//! ```text
//!                 Output::push()
//!                       │
//!          ┌────────────┴─────────────┐
//!          │ intermediate ring?       │
//!          ▼ yes                      ▼ no
//!    [Fanout task] ──────────► Targets::fan_out()
//!                                     │
//!         ┌───────────────────────────┼───────────────────────────┐
//!         ▼                           ▼                           ▼
//!   OutputStream #0             OutputStream #1             OutputStream #2
//!   want()? ─► ring ─► worker   want()? ─► ring ─► worker   want()? ─► ring ─► worker
//!                 │                           │                           │
//!                UDP                        HTTP                        file
//! ```
//!
//! Ids are handed out in order and never reused, so a caller holding an
//! id across `reclaim_resources()` cannot end up addressing a different
//! target.

pub mod config;
mod fanout;
pub mod store;

/// Identifier of a target within one [`Output`]
pub type TargetId = usize;

pub use config::{OutputConfig, OutputOptions};
pub use store::Output;
