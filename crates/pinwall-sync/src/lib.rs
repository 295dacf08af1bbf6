//! Real-time board synchronization for Pinwall.
//!
//! Keeps one client's view of a shared board consistent with a durable
//! document store, coordinates soft locks and presence through an ephemeral
//! coordination store, and runs agent commands as soft-committed batches.
//!
//! # Layers
//!
//! ```text
//! ┌───────────────────────────── BoardSession ─────────────────────────────┐
//! │  GestureSession   BoardMutator   AgentOrchestrator                     │
//! │        │               │                 │                             │
//! │  LockCoordinator ──────┼─────────────────┤        PresenceHandle       │
//! │        │               ▼                 ▼               │             │
//! │        │        ObjectStore + SpatialIndex ◀── ChangeFeed │             │
//! └────────┼───────────────────────────────────────┼─────────┼─────────────┘
//!          ▼                                       ▼         ▼
//!   CoordinationStore                        DocumentStore   CoordinationStore
//! ```
//!
//! Collaborators are traits in [`backend`]; [`backend::memory`] has in-memory
//! implementations used by tests and `pinwall-sim`.

pub mod agent;
pub mod backend;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod feed;
pub mod gesture;
pub mod locks;
pub mod mutations;
pub mod presence;
pub mod session;
pub mod spatial;
pub mod store;
pub mod subscription;
pub mod tools;

pub use agent::{AgentOrchestrator, CommandReport, OperationOutcome};
pub use backend::{
    BatchWrite, ChangeKind, ChildEvent, CleanupId, ConnectionState, CoordinationStore,
    DocumentChange, DocumentStore, FeedNotification, ToolRequest, ToolService, ToolStreamItem,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use error::{BackendError, Result, SyncError};
pub use feed::{ChangeFeed, FeedOutcome, FeedState, FeedSync};
pub use gesture::{GestureKind, GestureSession};
pub use locks::{LockCoordinator, LockEvent, LockStatus};
pub use mutations::{BoardMutator, DeleteOutcome, DeletePlan};
pub use presence::{PresenceHandle, PresenceIdentity, PresenceState};
pub use session::{BoardSession, Collaborators};
pub use spatial::SpatialIndex;
pub use store::{ObjectStore, OpSource, StoreChange, StoreEvent};
pub use subscription::{Publisher, Subscription};
pub use tools::{ArrangeSpec, ClampReport, CreateSpec, ToolCall, UpdateSpec};
