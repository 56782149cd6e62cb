//! Warden Core - shared foundation for the recovery and audit daemons
//!
//! Provides:
//! - Domain types (requests, phases, audit contracts)
//! - The validated configuration struct
//! - The fixed stage pipeline
//! - Collaborator seams: request store, message bus, opaque workers
//! - A NATS JetStream bus client and an in-process bus
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_core::prelude::*;
//!
//! let config = WardenConfig::load(None)?;
//! let pipeline = Pipeline::from_config(&config.pipeline);
//! assert_eq!(pipeline.next_stage("critique").map(|s| s.name.as_str()), Some("backend"));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod bus;
pub mod config;
pub mod error;
pub mod nats;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod worker;

pub use bus::{publish_json, BusMessage, InMemoryBus, MessageBus, PublishAck, StreamInfo, Subscription};
pub use config::WardenConfig;
pub use error::{BusError, ConfigError, StoreError, WorkerError};
pub use nats::NatsBus;
pub use pipeline::{Pipeline, PipelineStage};
pub use store::{HttpRequestStore, InMemoryRequestStore, RequestStore};
pub use types::{
    Assignment, AuditRequest, AuditResponse, AuditResult, AuditStatus, AuditType, NewRequest,
    Phase, Priority, Request, RequestFilter, RequestId, Severity, StageCompletion, StatusUpdate,
};
pub use worker::{CommandWorker, Worker, WorkerBridge};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Warden Core
    pub use crate::{
        BusMessage, InMemoryBus, InMemoryRequestStore, MessageBus, Phase, Pipeline, Request,
        RequestId, RequestStore, StatusUpdate, WardenConfig,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
