//! Property Sync Core
//!
//! Runs scheduled synchronization jobs against rental-property suppliers and
//! turns provider snapshots into minimal changesets for the booking platform.
//!
//! # Flow
//!
//! ```text
//! Scheduler ──send(job_id)──► JobQueue ──receive──► worker
//!                                                     │
//!                                                     ▼
//!                                   ┌──────────────────────────────────┐
//!                                   │ TaskExecutor                     │
//!                                   │  find → resolve owner → claim    │
//!                                   │  HandlerRegistry["type.supplier"]│
//!                                   │  run under timeout → complete    │
//!                                   └──────────────────────────────────┘
//!                                                     │
//!                                                     ▼
//!                                   handler: diff(previous, current)
//!                                            → ChangePublisher
//! ```

pub mod context;
pub mod diff;
pub mod entity;
pub mod executor;
pub mod publish;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;

pub use context::JobContext;
pub use diff::{diff, diff_list, Diff, DiffError, Diffable, EntityUpdate, ListDiff, RESERVED_FIELDS};
pub use entity::{Image, Property, Unit};
pub use executor::{Execution, ExecutorError, Skip, TaskExecutor, HANDLER_TIMEOUT};
pub use publish::{publish_property_changes, ChangePublisher, Publication};
pub use queue::{JobQueue, MemoryQueue, QueueMessage};
pub use registry::{HandlerRegistry, RegistryError, SyncHandler};
pub use scheduler::Scheduler;
pub use sink::{Condition, ErrorSink, MemorySink, TracingSink};
pub use store::{JobStore, OwnerStore};
pub use store_memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store_postgres::{PgQueue, PgStore};
pub use types::*;
