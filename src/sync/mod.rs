//! Pull-based sync from the remote into the local mirror.
//!
//! - **Reconcile**: idempotent upserts of one batch per transaction
//! - **Jobs**: a durable record for every invocation, nested under a root
//!   for full syncs
//! - **Engine**: the document → workspace → element → part/feature cascade
//! - **Worker**: a tokio worker pool that runs sync tasks in the background
//!
//! # Example
//!
//! ```ignore
//! use cm::sync::{EngineSettings, SyncEngine, SyncRequest, WorkerPool};
//!
//! let engine = Arc::new(SyncEngine::new(client, storage, EngineSettings::from(&settings)));
//! let pool = WorkerPool::new(engine, settings.worker_count, settings.cascade_timeout());
//! let handle = pool.submit(SyncRequest::Full { document_ids: vec![], force_refresh: false })?;
//! println!("accepted {}", handle.task_id);
//! let reports = pool.drain().await;
//! ```

pub mod engine;
pub mod jobs;
pub mod locks;
pub mod reconcile;
pub mod worker;

pub use engine::{EngineSettings, SyncContext, SyncEngine, SyncOutcome};
pub use jobs::{ABANDONED_MESSAGE, JobHandle, JobTracker};
pub use locks::KeyedLocks;
pub use reconcile::{BatchStats, Incoming, Mirrored, Parent, RawKey};
pub use worker::{SyncRequest, TaskHandle, TaskReport, WorkerPool};
