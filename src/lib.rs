//! Xtraq-core: SQL Server catalog metadata collection, change-driven
//! invalidation, and stored-procedure/function shape analysis for the
//! Xtraq build-time code generator.
//!
//! This crate is the core pipeline only (spec.md §1): `ConfigResolver →
//! InvalidationOrchestrator ⇄ {CatalogReader, SnapshotStore,
//! DependencyGraph} → ProcedureAstAnalyzer → MetadataEnricher →
//! SnapshotWriter`. CLI argument parsing, the templating engine, and a
//! concrete SQL Server driver are out of scope and live in downstream
//! crates that depend on this one.

pub mod ast;
pub mod catalog;
pub mod config;
pub mod dependency;
pub mod enrich;
pub mod error;
pub mod invalidation;
pub mod model;
pub mod snapshot;
pub mod telemetry;
pub mod warnings;

pub use error::{XtraqError, XtraqResult};
