//! # Realtree Core
//!
//! Client-side write and cache layer for hierarchical realtime databases.
//!
//! This crate provides:
//! - Location model (`Node`) with structural path equality
//! - Staging tree of pending writes with conflict-resolving merges
//! - Database and storage contracts consumed by the sync layer
//! - An in-memory database implementing both contracts with observers
//! - Transactions with async preconditions, LIFO reversions and merging
//! - Load with timeout that fires exactly once
//!
//! ## Key Invariants
//!
//! - A location holds a value, a file or children, never more than one
//! - Leaves are replaced, never merged deeper
//! - Reversions run in reverse registration order
//! - Preconditions added while others run are always awaited
//! - Locks are never held while user callbacks run

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod database;
mod error;
mod node;
mod snapshot;
mod staging;
mod transaction;
mod value;

pub use cache::InMemoryDatabase;
pub use config::{CachePolicy, RealtimeConfig};
pub use database::{
    load_with_timeout, CancelCallback, CancelListener, ChildChange, CommitCompletion, DataEvent,
    DataListener, DataOrdering, FileCompletion, FileLoadCompletion, FilesCompletion,
    LoadCompletion, ObserverToken, PageQuery, RealtimeDatabase, RealtimeStorage, Subscription,
};
pub use error::{CoreError, CoreResult};
pub use node::{Ancestors, InternalKeys, Node};
pub use snapshot::Snapshot;
pub use staging::{
    AppendObserver, ConflictResolver, FileMetadata, FileNode, MergeStrategy, ObjectNode,
    StagingNode, StagingRef, ValueNode,
};
pub use transaction::{
    CommitOptions, CommitOutcome, Completion, OutcomeCompletion, Precondition,
    PreconditionPromise, RealtimeValueEvents, Reversion, Transaction, TransactionState,
    TransactionSubstate, WritableValue,
};
pub use value::DatabaseValue;
