//! Lifecycle of the shared async storage pod
//!
//! One storage pod per user namespace keeps the projects of ephemeral
//! workspaces. It shares the user's common claim with persistent workspaces
//! and must never run at the same time as one of them:
//!
//! - [`AsyncStorageProvisioner`] creates it for `asyncPersist` workspaces
//! - [`AsyncStoragePodInterceptor`] removes it, and waits, before a persistent start
//! - [`AsyncStoragePodReaper`] removes it for users idle past the shutdown timeout

#![deny(missing_docs)]

pub mod config;
pub mod interceptor;
pub mod legacy;
pub mod provisioner;
pub mod reaper;

pub use config::{AsyncStorageConfig, ReaperConfig};
pub use interceptor::AsyncStoragePodInterceptor;
pub use provisioner::AsyncStorageProvisioner;
pub use reaper::{AsyncStoragePodReaper, SweepReport};
