//! Siteplan – a declarative action-plan engine for video-site connectors
//!
//! Each supported site is described by JSON configuration: a handful of
//! variables plus named action plans (lists of steps such as `http`, `get`,
//! `array`, `yield`). This crate provides:
//! - A validating plan builder and a resumable step interpreter
//! - Site instances that run plans asynchronously, one step batch per reply
//! - Admission control, timeout sweeping and per-domain sub-action delegation
//! - A reqwest-backed transport and host hooks for interactive pages

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Plan representation, builder and interpreter
pub mod interpreter;
/// Sites, contexts and their collaborators
pub mod runtime;
/// Shared helpers
pub mod util;

pub use interpreter::{Plan, Stash, build_plan, build_plan_value};
pub use runtime::{RuntimeConfig, Services, Site, SiteCatalog, SiteConfig, SiteEvent};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
