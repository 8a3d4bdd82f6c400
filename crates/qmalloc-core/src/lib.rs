//! # qmalloc-core
//!
//! A 64-bit quantum-based native memory allocator. Allocations from 8 bytes
//! up to multiple terabytes are served out of a single reserved virtual
//! address region, backed only by OS reservation/commit primitives and
//! tracked with atomic bitmap registries. There are no locks, monitors, or
//! free-lists anywhere on the allocation path.
//!
//! The allocator is layered:
//!
//! - [`registry`] tracks occupancy of enumerable resources with a bitmap and
//!   a moving lowest-free-word cursor,
//! - [`partition`] carves one partition into fixed-size quanta,
//! - [`quantum`] manages many partitions, each assignable to any size order
//!   in the allocator's configured range,
//! - [`slab`] serves large one-off self-aligned reservations,
//! - [`roster`] maps a size order to the component that serves it in a
//!   single atomic load,
//! - [`native`] owns the root reservation and exposes the public API.
//!
//! Addresses cross this API as plain `u64` values with `0` meaning "no
//! allocation"; that is the external contract with foreign-memory callers.
//! No `unsafe` code is permitted outside the virtual-memory facade.

#![deny(unsafe_code)]

pub mod common;
pub mod config;
pub mod native;
pub mod partition;
pub mod quantum;
pub mod registry;
pub mod roster;
pub mod slab;
pub mod space;
#[allow(unsafe_code)]
pub mod vm;

pub use config::HeapConfig;
pub use native::{AllocatorError, NativeAllocator};
