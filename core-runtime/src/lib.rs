//! # Core Runtime Module
//!
//! Ambient infrastructure shared by the sync core:
//! - Logging and tracing setup
//! - Configuration and bridge injection
//! - Event bus for engine notifications
//!
//! ## Overview
//!
//! Nothing in here knows about trackers or change ids. The sync crate builds
//! on these pieces: it reads its bridges from [`config::CoreConfig`], logs
//! through the subscriber installed by [`logging::init_logging`], and reports
//! progress on an [`events::EventBus`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
