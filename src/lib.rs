#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Batch Core
//!
//! Persistence and state-transition core for a batch job execution runtime.
//!
//! ## Overview
//!
//! This crate tracks job instances, job executions, and step thread
//! instances/executions (top-level and partitioned), persists their lifecycle
//! state across restarts and crashes, and supports cross-process partition
//! dispatch. It enforces legal state transitions, creates and advances
//! execution records with correct parent/child linkage, and reconciles
//! in-flight executions at startup after an unclean shutdown.
//!
//! The step/chunk processing engine, job-definition parsing, and the REST
//! surface are external collaborators; they drive this core through the
//! [`persistence::PersistenceService`] contract and hand over
//! [`models::RuntimeStepSnapshot`] values to be persisted verbatim.
//!
//! ## Backends
//!
//! Two interchangeable implementations sit behind one contract, selected at
//! process configuration time:
//!
//! - [`persistence::sql::SqlPersistence`] — durable PostgreSQL backend. Each
//!   operation runs in its own transaction; schema versions are detected once
//!   at activation (down-level stores keep working with reduced capability);
//!   startup recovery resolves this server's in-flight executions before any
//!   request is served.
//! - [`persistence::memory::MemoryPersistence`] — process-local maps with
//!   atomic id generators, backed by a store whose lifetime is the whole
//!   process. No external storage; intended for dev and test.
//!
//! ## Module Organization
//!
//! - [`models`] - Entity model: instances, executions, step threads, partitions
//! - [`state_machine`] - Status/state transition validation
//! - [`persistence`] - The backend contract, both backends, startup recovery
//! - [`config`] - Environment-driven configuration
//! - [`error`] - Structured error taxonomy
//! - [`location`] - Server identity for dispatch-ownership stamping
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_core::config::BatchCoreConfig;
//! use batch_core::location::StaticLocation;
//! use batch_core::persistence::memory::{MemoryPersistence, MemoryStore};
//! use batch_core::persistence::PersistenceService;
//! use batch_core::models::NewJobInstance;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BatchCoreConfig::from_env()?;
//! let location = Arc::new(StaticLocation::new(&config.server_id, &config.rest_url));
//! let store = Arc::new(MemoryStore::new());
//! let persistence = MemoryPersistence::new(store, location);
//!
//! let instance = persistence
//!     .create_job_instance(NewJobInstance {
//!         job_name: "payroll".into(),
//!         job_xml_name: Some("payroll-job".into()),
//!         job_xml: None,
//!         submitter: Some("alice".into()),
//!         create_time: chrono::Utc::now().naive_utc(),
//!     })
//!     .await?;
//! println!("submitted as instance {}", instance.instance_id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod location;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod state_machine;

pub use config::BatchCoreConfig;
pub use error::{BatchError, Result};
pub use location::{BatchLocation, StaticLocation};
pub use models::{
    BatchStatus, InstanceState, JobExecution, JobInstance, NewJobInstance, RemotablePartition,
    RemotablePartitionKey, RemotablePartitionState, RuntimeStepSnapshot, StepMetrics,
    StepThreadExecution, StepThreadExecutionAggregate, StepThreadInstance, StepThreadInstanceKey,
};
pub use persistence::{PersistenceService, RecoveryStore, SchemaVersions};
