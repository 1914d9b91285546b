//! Backend implementations for the game's remote procedures.
//!
//! This module provides concrete [`Backend`](crate::Backend) implementations
//! behind feature gates. Enable the corresponding Cargo feature to pull in
//! a backend:
//!
//! | Feature        | Backend         |
//! |----------------|-----------------|
//! | `backend-rest` | [`RestBackend`] |
//!
//! Tests and offline builds implement the trait directly; see
//! `demos/offline_session.rs`.

#[cfg(feature = "backend-rest")]
pub mod rest;

#[cfg(feature = "backend-rest")]
pub use rest::{RestBackend, RestConfig};
