//! Safe Circle Core Library
//!
//! Core functionality for Safe Circle: small trusted groups ("circles")
//! whose members broadcast a safety status during an emergency and watch
//! each other's status in near real time.
//!
//! - [`circle`]: the membership and status synchronization engine over a
//!   remote (push) or local (polled `SQLite`) store
//! - [`identity`]: sign-in/sign-up contract with attempt limiting
//! - [`config`]: process-wide backend selection
//! - [`validation`]: input checks and phone normalisation

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod circle;
pub mod clock;
pub mod config;
pub mod identity;
pub mod validation;

pub use circle::{CircleError, CircleSession, CircleStore, CircleSyncEngine};
pub use config::{Backend, SyncConfig};
pub use identity::{AuthError, IdentityProvider};
