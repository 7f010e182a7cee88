//! Local Storage Module
//!
//! Holds the entries this node owns, sharded by segment.
//!
//! ## Core Concepts
//! - **Segments**: keys are hashed into a fixed number of segments by the `KeyPartitioner`;
//!   the container keeps one map per segment.
//! - **Ownership**: the container never decides ownership itself. Callers pass an ownership
//!   predicate to [`DataContainer::apply`] and prune with [`DataContainer::retain_segments`]
//!   after a rebalance.
//! - **State transfer**: whole segments are dumped for new owners and inserted on arrival
//!   without overwriting newer writes.

pub mod container;


pub use container::{ApplyOutcome, DataContainer};
