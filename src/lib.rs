//! Tenant Metrics Library
//!
//! Business metrics for a multi-tenant scheduling platform: per-tenant
//! appointment, revenue, conversation and billing snapshots, a platform-wide
//! rollup built from the same values, first-class conversations grouped from
//! raw message history, and consistency checks over everything stored.
//!
//! # Modules
//!
//! - `api`: HTTP surface and background jobs.
//! - `core`: Metric computation and consistency logic.
//! - `data`: Data access layer.
//! - `checksum`: Canonical JSON checksums for stored payloads.
//! - `circuit_breaker`: Circuit breaker for scheduled recalculations.
//! - `config`: Configuration management.
//! - `consistency`: Invariant checks over stored snapshots.
//! - `conversation`: Session grouping and outcome resolution.
//! - `db`: Database connection, pool and migrations.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers and routes.
//! - `metrics`: Pure metric calculators and the platform rollup.
//! - `metrics_storage`: Source loaders, ingestion and snapshot upserts.
//! - `models`: Rows and API payloads.
//! - `period`: Calendar periods and their parsing.
//! - `plans`: Plan tiers and conversation billing.
//! - `scheduler`: Periodic recalculation loop.
//! - `services`: Recalculation, reads and consistency orchestration.

pub mod api;
pub mod core;
pub mod data;

// Re-export primary modules for shared use in tests and other binaries
pub mod checksum;
pub mod circuit_breaker;
pub mod config;
pub mod consistency;
pub mod conversation;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod metrics_storage;
pub mod models;
pub mod period;
pub mod plans;
pub mod scheduler;
pub mod services;
