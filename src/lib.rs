//! OxideSync - remote file sessions and directory synchronization
//!
//! A [`session::Session`] drives one connection through a pluggable
//! [`backend::FileSystemBackend`] (SFTP, shell or in-memory), caches directory
//! listings and runs batch file operations with retry/skip/abort handling.
//! On top of it, [`sync`] compares local and remote trees and applies the
//! differences, and [`monitor`] keeps a remote directory up to date with a
//! local one. Connections can go through an SSH [`tunnel`].

pub mod backend;
pub mod config;
pub mod monitor;
pub mod path_utils;
pub mod session;
pub mod ssh;
pub mod sync;
pub mod tunnel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{CopyParams, EngineConfig, SessionData};
pub use session::{Session, SessionCallbacks, SessionError};

/// Install the global `tracing` subscriber (`RUST_LOG`, default `info`).
///
/// Does nothing when a subscriber is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
