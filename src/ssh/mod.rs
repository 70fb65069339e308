//! SSH module - connection plumbing shared by the SSH backends and the tunnel
//!
//! # Features
//! - Password and key authentication (prompting through session callbacks)
//! - Host key verification against a configured `SHA256:` fingerprint
//! - Single-owner handle task with a cloneable controller

pub mod client;
pub mod config;
mod error;
mod handle_owner;

pub use client::{fingerprint, ClientHandler, SshClient, SshConnection};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
