//! Durable state layer for the orchestrator control plane.
//!
//! Owns the PostgreSQL schema for teams, agents, gateway sessions, the
//! append-only audit log, and recovery checkpoints, plus the connection
//! pool and migration runner used to stand it up.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
