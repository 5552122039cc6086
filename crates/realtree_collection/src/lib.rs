//! # Realtree Collection
//!
//! Ordered local mirrors of remote collections.
//!
//! This crate provides:
//! - Sorted storage with index reporting (`SortedArray`)
//! - Collection element model (`CollectionElement`, `CollectionItem`)
//! - Ordered sync view turning remote child events into index diffs
//! - Paging controller sliding a key-bounded window over large collections
//! - `OrderedRemoteCollection` trait shared by collection implementations
//!
//! ## Key Invariants
//!
//! - Elements stay sorted after every applied change
//! - A removal the mirror cannot match is reported as a consistency error
//! - Page boundaries are fetched and dropped locally, never delivered twice

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod element;
mod error;
mod event;
mod paging;
mod sorted;
mod view;

pub use collection::OrderedRemoteCollection;
pub use element::{CollectionElement, CollectionItem};
pub use error::{CollectionError, CollectionResult};
pub use event::{CollectionChange, CollectionEvent};
pub use paging::{PagingControl, PagingController, PagingDelegate, StartCompletion};
pub use sorted::SortedArray;
pub use view::{Explorer, SortedCollectionView};
