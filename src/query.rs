// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Query descriptors, compilation and iteration
//!
//! A query is an include/exclude filter over archetype compositions.
//! Compiling a query caches the list of matching archetypes; `each` walks
//! that list under the right locks and hands the callback typed column
//! access row by row.

use std::any::TypeId;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::archetype::{archetype_hash, ArchetypeData, ArchetypeId};
use crate::component::{Component, ComponentSet, type_hash, MAX_SET_COMPONENTS};
use crate::entity::{Entity, EntityId};
use crate::error::Result;
use crate::world::World;

/// User-supplied mutex taken around query and observer callbacks
pub type UserMutex = Arc<Mutex<()>>;

/// Include/exclude filter plus the user mutexes locked during iteration
#[derive(Clone, Default)]
pub struct QueryDescriptor {
    pub(crate) include: Vec<TypeId>,
    pub(crate) exclude: Vec<TypeId>,
    pub(crate) mutexes: Vec<UserMutex>,
}

impl QueryDescriptor {
    pub(crate) fn add_include(&mut self, type_id: TypeId) {
        if !self.include.contains(&type_id) {
            self.include.push(type_id);
        }
    }

    pub(crate) fn add_exclude(&mut self, type_id: TypeId) {
        if !self.exclude.contains(&type_id) {
            self.exclude.push(type_id);
        }
    }

    /// Hash of the filter. Descriptors with the same include and exclude
    /// sets hash identically regardless of declaration order.
    pub fn hash(&self) -> u64 {
        let mut hash = archetype_hash(&self.include).0;
        for &type_id in &self.exclude {
            hash ^= type_hash(type_id);
        }
        hash
    }

    /// Match predicate against an archetype's sorted signature
    pub(crate) fn matches_types(&self, types: &[TypeId]) -> bool {
        self.include
            .iter()
            .all(|t| types.binary_search(t).is_ok())
            && self.exclude.iter().all(|t| types.binary_search(t).is_err())
    }

    /// Match predicate against an event's column-pointer map
    pub(crate) fn matches_columns(&self, columns: &FxHashMap<TypeId, *mut u8>) -> bool {
        self.include.iter().all(|t| columns.contains_key(t))
            && self.exclude.iter().all(|t| !columns.contains_key(t))
    }

    pub(crate) fn lock_mutexes(&self) -> SmallVec<[MutexGuard<'_, ()>; 2]> {
        // Declaration order keeps lock acquisition stable across callers
        self.mutexes.iter().map(|m| m.lock()).collect()
    }
}

/// Typed column access for a query callback.
///
/// Implemented for `&C`, `&mut C` and tuples of those up to eight entries.
/// The component list is given explicitly at the call site:
/// `query.each::<(&Position, &mut Velocity), _>(..)`.
pub trait QueryFetch {
    /// Number of columns this fetch consumes
    const LEN: usize;

    /// The references handed to the callback for one row
    type Item<'a>;

    /// Component types in declaration order
    fn type_ids() -> SmallVec<[TypeId; MAX_SET_COMPONENTS]>;

    /// Build one row's item from column base pointers.
    ///
    /// # Safety
    /// `columns` must hold `Self::LEN` base pointers matching `type_ids`
    /// order and element types, and `row` must be within every column's
    /// bounds. Mutable fetches require that no other reference to the same
    /// cell is alive.
    unsafe fn fetch<'a>(columns: &[NonNull<u8>], row: usize) -> Self::Item<'a>;
}

impl<'q, C: Component> QueryFetch for &'q C {
    const LEN: usize = 1;
    type Item<'a> = &'a C;

    fn type_ids() -> SmallVec<[TypeId; MAX_SET_COMPONENTS]> {
        let mut ids = SmallVec::new();
        ids.push(TypeId::of::<C>());
        ids
    }

    unsafe fn fetch<'a>(columns: &[NonNull<u8>], row: usize) -> &'a C {
        &*columns[0].as_ptr().cast::<C>().add(row)
    }
}

impl<'q, C: Component> QueryFetch for &'q mut C {
    const LEN: usize = 1;
    type Item<'a> = &'a mut C;

    fn type_ids() -> SmallVec<[TypeId; MAX_SET_COMPONENTS]> {
        let mut ids = SmallVec::new();
        ids.push(TypeId::of::<C>());
        ids
    }

    unsafe fn fetch<'a>(columns: &[NonNull<u8>], row: usize) -> &'a mut C {
        &mut *columns[0].as_ptr().cast::<C>().add(row)
    }
}

macro_rules! impl_query_fetch {
    ($($T:ident),*) => {
        impl<$($T: QueryFetch),*> QueryFetch for ($($T,)*) {
            const LEN: usize = 0 $(+ $T::LEN)*;
            type Item<'a> = ($($T::Item<'a>,)*);

            fn type_ids() -> SmallVec<[TypeId; MAX_SET_COMPONENTS]> {
                let mut ids = SmallVec::new();
                $(ids.extend($T::type_ids());)*
                ids
            }

            #[allow(unused_assignments)]
            unsafe fn fetch<'a>(columns: &[NonNull<u8>], row: usize) -> Self::Item<'a> {
                let mut offset = 0;
                ($({
                    let item = $T::fetch(&columns[offset..offset + $T::LEN], row);
                    offset += $T::LEN;
                    item
                },)*)
            }
        }
    };
}

impl_query_fetch!(A);
impl_query_fetch!(A, B);
impl_query_fetch!(A, B, C);
impl_query_fetch!(A, B, C, D);
impl_query_fetch!(A, B, C, D, E);
impl_query_fetch!(A, B, C, D, E, F);
impl_query_fetch!(A, B, C, D, E, F, G);
impl_query_fetch!(A, B, C, D, E, F, G, H);

/// Where a `QueryIter` reads its component data from
enum IterSource<'a> {
    /// Live archetype rows, indexed by absolute row
    Live(&'a ArchetypeData),
    /// Event batch pointer map, indexed by position within the batch
    Batch(&'a FxHashMap<TypeId, *mut u8>),
}

/// Per-row context handed to query, observer and system callbacks
pub struct QueryIter<'a> {
    /// Entity id of the current row
    pub id: EntityId,
    /// Iteration index: the row within the archetype for queries, the
    /// position within the batch for observers
    pub index: u32,
    /// Time since last frame for system iteration, zero elsewhere
    pub dt: f32,
    world: &'a World,
    source: IterSource<'a>,
}

impl<'a> QueryIter<'a> {
    pub(crate) fn live(
        id: EntityId,
        index: u32,
        dt: f32,
        world: &'a World,
        data: &'a ArchetypeData,
    ) -> Self {
        Self {
            id,
            index,
            dt,
            world,
            source: IterSource::Live(data),
        }
    }

    pub(crate) fn batch(
        id: EntityId,
        index: u32,
        world: &'a World,
        columns: &'a FxHashMap<TypeId, *mut u8>,
    ) -> Self {
        Self {
            id,
            index,
            dt: 0.0,
            world,
            source: IterSource::Batch(columns),
        }
    }

    /// Check if the current entity has a component
    pub fn has<C: Component>(&self) -> bool {
        match &self.source {
            IterSource::Live(data) => data.column(&TypeId::of::<C>()).is_some(),
            IterSource::Batch(columns) => columns.contains_key(&TypeId::of::<C>()),
        }
    }

    /// Get a component of the current entity.
    ///
    /// Prefer declaring the component in the fetch tuple; this is for
    /// components outside the query's include set.
    pub fn get<C: Component>(&self) -> Option<&C> {
        match &self.source {
            IterSource::Live(data) => {
                let store = data.column(&TypeId::of::<C>())?;
                Some(unsafe { &*store.ptr(self.index as usize).cast::<C>() })
            }
            IterSource::Batch(columns) => {
                let base = *columns.get(&TypeId::of::<C>())?;
                Some(unsafe {
                    &*base
                        .cast::<C>()
                        .add(self.index as usize)
                        .cast_const()
                })
            }
        }
    }

    /// Access another entity's components.
    ///
    /// Re-enters the foreign archetype's read lock; do not use it to reach
    /// back into the archetype currently locked for writing.
    pub fn entity(&self, id: EntityId) -> Result<Entity<'a>> {
        self.world.get_entity(id)
    }

    /// The world this iteration runs in
    pub fn world(&self) -> &'a World {
        self.world
    }
}

/// A compiled filter with its cached list of matching archetypes
pub(crate) struct CompiledQuery {
    pub(crate) descriptor: QueryDescriptor,
    /// Matching archetype ids in archetype creation order; appended to when
    /// new archetypes appear
    pub(crate) groups: RwLock<Vec<ArchetypeId>>,
}

/// Builder for queries, obtained from [`World::query`]
pub struct QueryFactory<'w> {
    world: &'w World,
    descriptor: QueryDescriptor,
}

impl<'w> QueryFactory<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            descriptor: QueryDescriptor::default(),
        }
    }

    /// Require every component type in `S` to be present
    pub fn include<S: ComponentSet>(mut self) -> Self {
        for type_id in S::type_ids() {
            self.descriptor.add_include(type_id);
        }
        self
    }

    /// Reject archetypes carrying any component type in `S`
    pub fn exclude<S: ComponentSet>(mut self) -> Self {
        for type_id in S::type_ids() {
            self.descriptor.add_exclude(type_id);
        }
        self
    }

    /// Add a mutex to lock around every callback invocation, in the order
    /// the locks were declared
    pub fn lock(mut self, mutex: &UserMutex) -> Self {
        self.descriptor.mutexes.push(mutex.clone());
        self
    }

    /// Compile the query, caching its matched-archetype list in the world
    pub fn compile(self) -> Query<'w> {
        let inner = self.world.register_query(self.descriptor);
        Query {
            world: self.world,
            inner,
        }
    }
}

/// An iterable compiled query
pub struct Query<'w> {
    world: &'w World,
    inner: Arc<CompiledQuery>,
}

impl<'w> Query<'w> {
    pub(crate) fn from_parts(world: &'w World, inner: Arc<CompiledQuery>) -> Self {
        Self { world, inner }
    }

    /// Invoke `fn` once per matching entity.
    ///
    /// The fetch tuple `D` declares the columns handed to the callback; it
    /// must stay within the query's include set. Rows are visited in
    /// ascending order within an archetype and archetypes in creation
    /// order. The callback runs under the archetype's read lock and the
    /// declared user mutexes, so it may read and write the fetched cells in
    /// place but must not reshape the archetype; structural changes made
    /// through the world are queued for the next tick.
    pub fn each<D, F>(&self, callback: F)
    where
        D: QueryFetch,
        F: for<'a> FnMut(QueryIter<'a>, D::Item<'a>),
    {
        self.each_dt::<D, F>(0.0, callback)
    }

    /// Like [`each`](Self::each) with a delta-time forwarded to the
    /// iterator, for system execution
    pub fn each_dt<D, F>(&self, dt: f32, mut callback: F)
    where
        D: QueryFetch,
        F: for<'a> FnMut(QueryIter<'a>, D::Item<'a>),
    {
        // Snapshot so the match set is fixed at the time iteration starts
        let matched: Vec<ArchetypeId> = self.inner.groups.read().clone();
        let type_ids = D::type_ids();

        'groups: for group_id in matched {
            let Some(group) = self.world.group(group_id) else {
                continue;
            };
            let data = group.data.read();
            let _mutexes = self.inner.descriptor.lock_mutexes();

            let mut columns: SmallVec<[NonNull<u8>; MAX_SET_COMPONENTS]> =
                SmallVec::with_capacity(type_ids.len());
            for type_id in &type_ids {
                match data.column(type_id) {
                    // Base pointers; the fetch steps by the statically known
                    // component size.
                    Some(store) => columns.push(unsafe {
                        NonNull::new_unchecked(store.ptr(0))
                    }),
                    None => continue 'groups,
                }
            }

            for row in 0..data.len() {
                let iter = QueryIter::live(data.entities[row], row as u32, dt, self.world, &data);
                callback(iter, unsafe { D::fetch(&columns, row) });
            }
        }
    }

    /// Number of entities the query currently matches
    pub fn count(&self) -> usize {
        let matched: Vec<ArchetypeId> = self.inner.groups.read().clone();
        matched
            .into_iter()
            .filter_map(|id| self.world.group(id))
            .map(|group| group.data.read().len())
            .sum()
    }
}
