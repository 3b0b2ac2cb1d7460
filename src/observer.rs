//! Lifecycle observers
//!
//! An observer is a query descriptor attached to one of four event
//! channels. When a batch of entities enters or leaves an archetype, every
//! observer of the right channel whose filter matches the batch's columns
//! is invoked with the batch ids and typed column access.

use std::any::TypeId;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::{ComponentSet, MAX_SET_COMPONENTS};
use crate::entity::EntityId;
use crate::query::{QueryDescriptor, QueryFetch, QueryIter, UserMutex};
use crate::world::World;

/// The four lifecycle event channels.
///
/// Create fires exactly once in an entity's life, when its initial batch is
/// inserted; Enter fires every time an entity joins a matching archetype,
/// including that initial insert and later component transitions. Remove
/// mirrors Create and Exit mirrors Enter on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A batch has just entered an archetype for the first time
    Create = 0,
    /// A batch is about to leave the world (queued removals, applied at tick)
    Remove,
    /// A batch was inserted into a matching archetype
    Enter,
    /// A batch is leaving a matching archetype
    Exit,
}

impl EventKind {
    pub(crate) const COUNT: usize = 4;
}

/// Type-erased observer callback. Receives the batch ids, the map from
/// component type to that type's column base pointer for the batch, and the
/// world.
pub(crate) type ObserverFn =
    Box<dyn FnMut(&[EntityId], &FxHashMap<TypeId, *mut u8>, &World) + Send>;

/// A registered observer: filter plus callback
pub(crate) struct Observer {
    pub(crate) descriptor: QueryDescriptor,
    /// Callbacks may carry mutable state and dispatch can come from any
    /// thread, so each one is serialized behind its own mutex.
    pub(crate) callback: Mutex<ObserverFn>,
}

impl Observer {
    pub(crate) fn matches(&self, columns: &FxHashMap<TypeId, *mut u8>) -> bool {
        self.descriptor.matches_columns(columns)
    }
}

/// Builder for observers, obtained from [`World::observer`].
///
/// Mirrors the query factory surface; the terminal [`each`](Self::each)
/// registers the observer with the world.
pub struct ObserverBuilder<'w> {
    world: &'w World,
    kind: EventKind,
    descriptor: QueryDescriptor,
}

impl<'w> ObserverBuilder<'w> {
    pub(crate) fn new(world: &'w World, kind: EventKind) -> Self {
        Self {
            world,
            kind,
            descriptor: QueryDescriptor::default(),
        }
    }

    /// Require every component type in `S` to be present in the batch
    pub fn include<S: ComponentSet>(mut self) -> Self {
        for type_id in S::type_ids() {
            self.descriptor.add_include(type_id);
        }
        self
    }

    /// Reject batches carrying any component type in `S`
    pub fn exclude<S: ComponentSet>(mut self) -> Self {
        for type_id in S::type_ids() {
            self.descriptor.add_exclude(type_id);
        }
        self
    }

    /// Add a mutex locked around every callback invocation
    pub fn lock(mut self, mutex: &UserMutex) -> Self {
        self.descriptor.mutexes.push(mutex.clone());
        self
    }

    /// Register the observer callback.
    ///
    /// The fetch tuple `D` must stay within the include set. For Remove and
    /// Exit events the fetched references point into detached copies of the
    /// removed rows, not live columns. Callbacks run under the emitting
    /// side's archetype lock; structural world calls from inside a callback
    /// must go through the queued paths.
    pub fn each<D, F>(self, callback: F)
    where
        D: QueryFetch + 'static,
        F: for<'a> FnMut(QueryIter<'a>, D::Item<'a>) + Send + 'static,
    {
        let mut callback = callback;
        let erased: ObserverFn = Box::new(move |ids, columns, world| {
            let type_ids = D::type_ids();
            let mut bases: SmallVec<[NonNull<u8>; MAX_SET_COMPONENTS]> =
                SmallVec::with_capacity(type_ids.len());
            for type_id in &type_ids {
                match columns.get(type_id) {
                    Some(&base) => bases.push(unsafe { NonNull::new_unchecked(base) }),
                    // The match predicate guarantees the include set, but a
                    // fetch outside it is a caller bug; skip the batch.
                    None => return,
                }
            }

            for (index, &id) in ids.iter().enumerate() {
                let iter = QueryIter::batch(id, index as u32, world, columns);
                callback(iter, unsafe { D::fetch(&bases, index) });
            }
        });

        self.world.register_observer(
            self.kind,
            Arc::new(Observer {
                descriptor: self.descriptor,
                callback: Mutex::new(erased),
            }),
        );
    }
}
