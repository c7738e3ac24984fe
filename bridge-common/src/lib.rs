//! Shared types and capability traits for the streambridge workspace.
//!
//! The bridge treats its durable stores, its stream transport and its
//! compute target as narrow capabilities: each gets one trait here, one
//! production implementation (Postgres, JetStream, HTTP) and one
//! in-memory implementation under [`memory`] for tests.

pub mod assignment;
pub mod binding;
pub mod health;
pub mod invoke;
pub mod memory;
pub mod metrics;
pub mod payload;
pub mod peer;
pub mod pgstore;
pub mod source;
pub mod store;
