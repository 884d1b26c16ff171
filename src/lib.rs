//! Distributed planning poker backend core: the team registry and
//! concurrency core plus the inter-node synchronization layer.
//!
//! Each node owns exactly one authoritative copy of every session it serves,
//! guarded by a scoped lock with a bounded wait; nodes discover and replicate
//! each other's sessions over a pluggable message bus. The HTTP transport and
//! concrete storage backends live outside this crate and consume the
//! `services` and `dao` seams.

pub mod bus;
pub mod config;
pub mod dao;
pub mod error;
pub mod services;
pub mod state;
