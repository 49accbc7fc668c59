//! `snapqueue`: a durable job pipeline that turns uploaded images and videos
//! into thumbnails, with retry/backoff, stall detection, and a live
//! publish/subscribe event feed for progress and completion.
//!
//! The five components map onto modules: [`store`] (Job Store), [`queue`]
//! (Queue), [`events`] (Event Bus), [`worker`] (Worker), [`processor`]
//! (Media Processor). [`pipeline`] bundles them behind the one surface an
//! upload boundary needs.

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::Config;
pub use domain::{File, FileKind, Job, JobStatus, StatusPatch, Thumbnail};
pub use error::{PipelineError, ProcessorError, QueueError, StoreError};
pub use events::{Event, EventBus, Topic};
pub use pipeline::Pipeline;
pub use queue::{Envelope, Queue};
pub use store::JobStore;
pub use worker::Worker;
