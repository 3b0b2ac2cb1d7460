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

//! World: central entity, archetype and observer storage
//!
//! The world arbitrates every structural mutation. Entity creation goes
//! through [`EntityBuilder`], removal and component transitions are queued
//! and drained by [`tick`](World::tick), and queries iterate under the
//! per-archetype locks.
//!
//! Lock order, outermost first: group map, archetype row lock, user
//! mutexes in declaration order, entity table. Observer callbacks run
//! under the emitting side's archetype lock; the queued mutation paths
//! (remove, add/remove component, contended creates) are safe to call from
//! any callback and land in the next tick.

use std::any::TypeId;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{archetype_hash, Archetype, ArchetypeData, ArchetypeId, ColumnSpec};
use crate::builder::{DeferredCreate, EntityBuilder, Staged};
use crate::component::Component;
use crate::entity::{Entity, EntityId, EntityRecord};
use crate::error::{EcsError, Result};
use crate::handle::HandleTable;
use crate::observer::{EventKind, Observer, ObserverBuilder};
use crate::query::{CompiledQuery, Query, QueryDescriptor, QueryFactory};

/// A queued add/remove-component request, applied at tick as an archetype
/// transition
struct TransitionOp {
    entity: EntityId,
    kind: TransitionKind,
}

enum TransitionKind {
    Add { spec: ColumnSpec, bytes: Vec<u8> },
    Remove { type_id: TypeId },
}

/// Central ECS world
pub struct World {
    /// Entity records keyed by generational handle
    pub(crate) entities: RwLock<HandleTable<EntityRecord>>,

    /// All archetypes, keyed by composition hash
    groups: RwLock<AHashMap<ArchetypeId, Arc<Archetype>>>,

    /// Compiled queries keyed by descriptor hash
    queries: RwLock<AHashMap<u64, Arc<CompiledQuery>>>,

    /// One observer list per event kind
    observers: [RwLock<Vec<Arc<Observer>>>; EventKind::COUNT],

    /// Fast-path skip for tick when no removal is pending
    remove_queued: AtomicU32,

    /// Creation requests whose archetype was contended
    deferred_creates: Mutex<Vec<DeferredCreate>>,

    /// Queued component transitions
    transitions: Mutex<Vec<TransitionOp>>,
}

impl World {
    /// Create a new, empty world
    pub fn new() -> Self {
        let mut entities = HandleTable::with_capacity(64);
        // Burn sparse slot 0 so the null id (index 0, counter 0) can never
        // validate
        let sentinel = entities.push(EntityRecord {
            group: ArchetypeId(0),
            row: 0,
            alive: false,
        });
        entities.remove(sentinel);
        entities.push(EntityRecord {
            group: ArchetypeId(0),
            row: 0,
            alive: false,
        });

        Self {
            entities: RwLock::new(entities),
            groups: RwLock::new(AHashMap::with_capacity(64)),
            queries: RwLock::new(AHashMap::with_capacity(32)),
            observers: std::array::from_fn(|_| RwLock::new(Vec::new())),
            remove_queued: AtomicU32::new(0),
            deferred_creates: Mutex::new(Vec::new()),
            transitions: Mutex::new(Vec::new()),
        }
    }

    /// Start building one or more entities
    pub fn entity(&self) -> EntityBuilder<'_> {
        EntityBuilder::new(self)
    }

    /// Start building a query
    pub fn query(&self) -> QueryFactory<'_> {
        QueryFactory::new(self)
    }

    /// Start building an observer for one event kind
    pub fn observer(&self, kind: EventKind) -> ObserverBuilder<'_> {
        ObserverBuilder::new(self, kind)
    }

    /// Queue an entity for removal.
    ///
    /// Removing entities while component data is being processed would pull
    /// rows out from under iterating callbacks, so removal only appends to
    /// the owning archetype's queue here. The entity stays visible to
    /// queries until [`tick`](World::tick) drains the queues.
    pub fn remove(&self, id: EntityId) -> Result<()> {
        let record = *self
            .entities
            .read()
            .get(id)
            .ok_or(EcsError::InvalidHandle)?;

        // Queue append runs under the group map's read lock
        let groups = self.groups.read_recursive();
        match groups.get(&record.group) {
            Some(group) => {
                group.remove_queue.lock().push(id);
                self.remove_queued.fetch_add(1, Ordering::AcqRel);
            }
            None => {
                warn!(entity = ?id, "could not find entity group");
            }
        }
        Ok(())
    }

    /// Queue adding a component to an entity.
    ///
    /// Applied at the next tick as an archetype transition, firing Exit on
    /// the old archetype and Enter on the new one. If the entity already
    /// has the component, the value is overwritten in place at tick and no
    /// events fire.
    pub fn add_component<C: Component>(&self, id: EntityId, component: C) -> Result<()> {
        if !self.entities.read().is_valid(id) {
            return Err(EcsError::InvalidHandle);
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &component as *const C as *const u8,
                std::mem::size_of::<C>(),
            )
        }
        .to_vec();
        self.transitions.lock().push(TransitionOp {
            entity: id,
            kind: TransitionKind::Add {
                spec: ColumnSpec {
                    type_id: TypeId::of::<C>(),
                    size: std::mem::size_of::<C>(),
                    align: std::mem::align_of::<C>(),
                },
                bytes,
            },
        });
        Ok(())
    }

    /// Queue removing a component from an entity; the transition mirrors
    /// [`add_component`](World::add_component)
    pub fn remove_component<C: Component>(&self, id: EntityId) -> Result<()> {
        let record = *self
            .entities
            .read()
            .get(id)
            .ok_or(EcsError::InvalidHandle)?;
        let group = self
            .group(record.group)
            .ok_or(EcsError::UnknownArchetype)?;
        if !group.contains(TypeId::of::<C>()) {
            return Err(EcsError::MissingComponent);
        }
        self.transitions.lock().push(TransitionOp {
            entity: id,
            kind: TransitionKind::Remove {
                type_id: TypeId::of::<C>(),
            },
        });
        Ok(())
    }

    /// Check whether an entity handle refers to a live entity
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.entities.read().get(id).map_or(false, |r| r.alive)
    }

    /// Copy a single component out of an entity
    pub fn get<C: Component>(&self, id: EntityId) -> Result<C> {
        loop {
            let record = *self
                .entities
                .read()
                .get(id)
                .ok_or(EcsError::InvalidHandle)?;
            let group = self
                .group(record.group)
                .ok_or(EcsError::UnknownArchetype)?;
            let data = group.data.read_recursive();

            // Re-validate under the row lock; the entity may have
            // transitioned between the record lookup and here
            let record = *self
                .entities
                .read()
                .get(id)
                .ok_or(EcsError::InvalidHandle)?;
            if record.group != group.id() {
                continue;
            }

            let store = data
                .column(&TypeId::of::<C>())
                .ok_or(EcsError::MissingComponent)?;
            let row = record.row as usize;
            debug_assert_eq!(data.entities[row], id);
            return Ok(unsafe { *store.ptr(row).cast::<C>() });
        }
    }

    /// Get a guarded accessor for an entity, holding its archetype's shared
    /// lock until dropped
    pub fn get_entity(&self, id: EntityId) -> Result<Entity<'_>> {
        loop {
            let record = *self
                .entities
                .read()
                .get(id)
                .ok_or(EcsError::InvalidHandle)?;
            let group = self
                .group(record.group)
                .ok_or(EcsError::UnknownArchetype)?;
            if let Some(entity) = Entity::acquire(self, group, id) {
                return Ok(entity);
            }
            // Entity moved between the lookup and the lock; retry
        }
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        // Slot 0 permanently holds the null sentinel
        self.entities.read().len() - 1
    }

    /// Number of archetypes ever created
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Apply all queued structural work.
    ///
    /// In order: replay deferred creates with deferral disallowed, apply
    /// component transitions, then drain every archetype's remove queue
    /// under the group map's read lock. No iteration that started before
    /// this call observes the removals; every iteration after it returns
    /// does. Structural requests queued by observers fired from in here
    /// land in the next tick.
    pub fn tick(&self) {
        let pending_creates = !self.deferred_creates.lock().is_empty();
        let pending_transitions = !self.transitions.lock().is_empty();
        if self.remove_queued.load(Ordering::Acquire) == 0
            && !pending_creates
            && !pending_transitions
        {
            return;
        }

        #[cfg(feature = "profiling")]
        let span = info_span!("world.tick");
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        self.drain_deferred_creates();
        self.drain_transitions();

        let groups = self.groups.read();
        let drained = self.process_remove_queues(&groups);
        drop(groups);
        if drained > 0 {
            // Subtract exactly what was drained; removals queued while the
            // drain ran stay counted for the next tick
            self.remove_queued.fetch_sub(drained, Ordering::AcqRel);
        }
    }

    // ---- internal: archetype management ----

    pub(crate) fn group(&self, id: ArchetypeId) -> Option<Arc<Archetype>> {
        self.groups.read_recursive().get(&id).cloned()
    }

    /// Find or create the archetype for a composition
    pub(crate) fn get_or_create_group(&self, specs: &[ColumnSpec]) -> Arc<Archetype> {
        let type_ids: SmallVec<[TypeId; 8]> = specs.iter().map(|s| s.type_id).collect();
        let id = archetype_hash(&type_ids);
        if let Some(group) = self.groups.read_recursive().get(&id) {
            return group.clone();
        }
        let mut groups = self.groups.write();
        self.create_group_locked(&mut groups, id, specs)
    }

    fn create_group_locked(
        &self,
        groups: &mut AHashMap<ArchetypeId, Arc<Archetype>>,
        id: ArchetypeId,
        specs: &[ColumnSpec],
    ) -> Arc<Archetype> {
        if let Some(group) = groups.get(&id) {
            return group.clone();
        }

        let seq = groups.len() as u32;
        let group = Arc::new(Archetype::new(id, seq, specs));
        groups.insert(id, group.clone());
        debug!(archetype = id.0, components = specs.len(), "created archetype");

        // Every compiled query re-evaluates its predicate against the new
        // archetype, so cached match lists stay fresh
        for query in self.queries.read().values() {
            if query.descriptor.matches_types(group.types()) {
                query.groups.write().push(id);
            }
        }
        group
    }

    // ---- internal: queries and observers ----

    pub(crate) fn register_query(&self, descriptor: QueryDescriptor) -> Arc<CompiledQuery> {
        let hash = descriptor.hash();
        if let Some(query) = self.queries.read().get(&hash) {
            return query.clone();
        }

        // Lock order: group map before query map
        let groups = self.groups.read_recursive();
        let mut queries = self.queries.write();
        if let Some(query) = queries.get(&hash) {
            return query.clone();
        }

        let mut matched: Vec<(u32, ArchetypeId)> = groups
            .values()
            .filter(|g| descriptor.matches_types(g.types()))
            .map(|g| (g.seq(), g.id()))
            .collect();
        matched.sort_unstable_by_key(|&(seq, _)| seq);

        let query = Arc::new(CompiledQuery {
            descriptor,
            groups: RwLock::new(matched.into_iter().map(|(_, id)| id).collect()),
        });
        queries.insert(hash, query.clone());
        query
    }

    pub(crate) fn compile_descriptor(&self, descriptor: QueryDescriptor) -> Query<'_> {
        Query::from_parts(self, self.register_query(descriptor))
    }

    pub(crate) fn register_observer(&self, kind: EventKind, observer: Arc<Observer>) {
        self.observers[kind as usize].write().push(observer);
    }

    /// Dispatch one event batch to every matching observer of `kind`.
    ///
    /// `columns` maps each of the batch's component types to the base
    /// pointer of that type's cells for the batch, either live column
    /// positions or detached scratch copies. The caller holds the relevant
    /// archetype lock.
    pub(crate) fn send_event(
        &self,
        kind: EventKind,
        ids: &[EntityId],
        columns: &FxHashMap<TypeId, *mut u8>,
    ) {
        if ids.is_empty() {
            return;
        }
        let list = self.observers[kind as usize].read();
        if list.is_empty() {
            return;
        }
        let matched: SmallVec<[Arc<Observer>; 4]> =
            list.iter().filter(|o| o.matches(columns)).cloned().collect();
        drop(list);

        for observer in matched {
            let _mutexes = observer.descriptor.lock_mutexes();
            let mut callback = observer.callback.lock();
            (*callback)(ids, columns, self);
        }
    }

    // ---- internal: creation ----

    pub(crate) fn defer_create(&self, op: DeferredCreate) {
        self.deferred_creates.lock().push(op);
    }

    /// Batch-insert staged components under the archetype's held write
    /// lock. Returns the new ids and the batch column base pointers.
    pub(crate) fn insert_staged(
        &self,
        group: &Archetype,
        data: &mut ArchetypeData,
        staged: &[Staged],
        count: u32,
    ) -> (Vec<EntityId>, FxHashMap<TypeId, *mut u8>) {
        let start = data.entities.len();
        let mut ids = Vec::with_capacity(count as usize);
        {
            let mut entities = self.entities.write();
            for i in 0..count as usize {
                let id = entities.push(EntityRecord {
                    group: group.id(),
                    row: (start + i) as u32,
                    alive: true,
                });
                data.entities.push(id);
                ids.push(id);
            }
        }

        let mut columns = FxHashMap::default();
        for staged in staged {
            let store = data.column_mut(&staged.type_id).unwrap();
            let base = store.push(staged.ptr.as_ptr(), count as usize);
            columns.insert(staged.type_id, base);
        }
        data.assert_columns_parallel();

        (ids, columns)
    }

    // ---- internal: tick drains ----

    fn drain_deferred_creates(&self) {
        let ops: Vec<DeferredCreate> = std::mem::take(&mut *self.deferred_creates.lock());
        for op in ops {
            // Re-run the builder's insert with deferral disallowed
            let count = op.count;
            EntityBuilder::replay(self, op).create_impl(count, false);
        }
    }

    fn drain_transitions(&self) {
        let ops: Vec<TransitionOp> = std::mem::take(&mut *self.transitions.lock());
        for op in ops {
            let Some(record) = self.entities.read().get(op.entity).copied() else {
                warn!(entity = ?op.entity, "skipping transition for stale entity");
                continue;
            };
            let Some(source) = self.group(record.group) else {
                warn!(entity = ?op.entity, "could not find entity group");
                continue;
            };

            match op.kind {
                TransitionKind::Add { spec, bytes } => {
                    if source.contains(spec.type_id) {
                        // Component already present: overwrite in place
                        let mut data = source.data.write();
                        let row = record.row as usize;
                        debug_assert_eq!(data.entities[row], op.entity);
                        if let Some(store) = data.column_mut(&spec.type_id) {
                            store.write(row, bytes.as_ptr());
                        }
                        continue;
                    }
                    self.transition_entity(op.entity, &source, Some((spec, bytes)), None);
                }
                TransitionKind::Remove { type_id } => {
                    if !source.contains(type_id) {
                        warn!(entity = ?op.entity, "component already gone before transition");
                        continue;
                    }
                    self.transition_entity(op.entity, &source, None, Some(type_id));
                }
            }
        }
    }

    /// Move one entity to the archetype for its composition plus `add` and
    /// minus `remove`, firing Exit on the source and Enter on the target
    fn transition_entity(
        &self,
        id: EntityId,
        source: &Arc<Archetype>,
        add: Option<(ColumnSpec, Vec<u8>)>,
        remove: Option<TypeId>,
    ) {
        // Detach the row, keeping byte copies of every cell
        let mut cells: Vec<(ColumnSpec, Vec<u8>)> = Vec::new();
        {
            let mut data = source.data.write();
            let record = *self.entities.read().get(id).unwrap();
            let row = record.row as usize;
            debug_assert_eq!(data.entities[row], id);

            let type_ids: Vec<TypeId> = data.columns.keys().copied().collect();
            for type_id in type_ids {
                let store = data.columns.get_mut(&type_id).unwrap();
                let mut bytes = Vec::with_capacity(store.type_size());
                store.copy_out(row, &mut bytes);
                cells.push((
                    ColumnSpec {
                        type_id,
                        size: store.type_size(),
                        align: store.type_align(),
                    },
                    bytes,
                ));
                store.swap_remove(row);
            }
            data.entities.swap_remove(row);
            if row < data.entities.len() {
                let moved = data.entities[row];
                if let Some(r) = self.entities.write().get_mut(moved) {
                    r.row = row as u32;
                }
            }
            data.assert_columns_parallel();
        }

        // Exit leaves the old composition with detached copies
        let ids = [id];
        let exit_columns: FxHashMap<TypeId, *mut u8> = cells
            .iter()
            .map(|(spec, bytes)| (spec.type_id, bytes.as_ptr() as *mut u8))
            .collect();
        {
            let _read = source.data.read();
            self.send_event(EventKind::Exit, &ids, &exit_columns);
        }

        // Re-hash into the target composition
        if let Some(type_id) = remove {
            cells.retain(|(spec, _)| spec.type_id != type_id);
        }
        if let Some((spec, bytes)) = add {
            cells.push((spec, bytes));
        }
        let specs: SmallVec<[ColumnSpec; 8]> = cells.iter().map(|(spec, _)| *spec).collect();
        let target = self.get_or_create_group(&specs);

        let mut data = target.data.write();
        let row = data.entities.len();
        for (spec, bytes) in &cells {
            data.columns
                .get_mut(&spec.type_id)
                .unwrap()
                .push(bytes.as_ptr(), 1);
        }
        data.entities.push(id);
        if let Some(record) = self.entities.write().get_mut(id) {
            *record = EntityRecord {
                group: target.id(),
                row: row as u32,
                alive: true,
            };
        }
        data.assert_columns_parallel();

        let enter_columns: FxHashMap<TypeId, *mut u8> = cells
            .iter()
            .map(|(spec, _)| {
                (
                    spec.type_id,
                    data.column(&spec.type_id).unwrap().ptr(row),
                )
            })
            .collect();
        let read = RwLockWriteGuard::downgrade(data);
        self.send_event(EventKind::Enter, &ids, &enter_columns);
        drop(read);
    }

    /// Drain every archetype's remove queue. Returns the number of queue
    /// entries consumed, including skipped stale ones.
    fn process_remove_queues(&self, groups: &AHashMap<ArchetypeId, Arc<Archetype>>) -> u32 {
        let mut drained = 0u32;
        for group in groups.values() {
            let queued: Vec<EntityId> = std::mem::take(&mut *group.remove_queue.lock());
            if queued.is_empty() {
                continue;
            }
            drained += queued.len() as u32;

            let mut data = group.data.write();

            // Per-column scratch blocks carry the removed rows to observers
            let specs: Vec<(TypeId, usize)> = data
                .columns
                .iter()
                .map(|(t, s)| (*t, s.type_size()))
                .collect();
            let mut scratch: FxHashMap<TypeId, Vec<u8>> = specs
                .iter()
                .map(|&(t, size)| (t, Vec::with_capacity(queued.len() * size)))
                .collect();
            let mut removed: Vec<EntityId> = Vec::with_capacity(queued.len());

            {
                let mut entities = self.entities.write();
                for id in queued {
                    let Some(record) = entities.get(id).copied() else {
                        warn!(entity = ?id, "skipping removal of stale entity");
                        continue;
                    };
                    if record.group != group.id() {
                        warn!(entity = ?id, "entity left the group before removal");
                        continue;
                    }
                    let row = record.row as usize;
                    debug_assert_eq!(data.entities[row], id);

                    for (type_id, _) in &specs {
                        let store = data.columns.get_mut(type_id).unwrap();
                        store.copy_out(row, scratch.get_mut(type_id).unwrap());
                        store.swap_remove(row);
                    }
                    data.entities.swap_remove(row);
                    if row < data.entities.len() {
                        let moved = data.entities[row];
                        if let Some(r) = entities.get_mut(moved) {
                            r.row = row as u32;
                        }
                    }

                    // Logical removal, then the handle slot is released and
                    // its counter bumped; the id is stale from here on
                    if let Some(r) = entities.get_mut(id) {
                        r.alive = false;
                    }
                    entities.remove(id);
                    removed.push(id);
                }
                data.assert_columns_parallel();
            }

            if removed.is_empty() {
                continue;
            }

            let columns: FxHashMap<TypeId, *mut u8> = scratch
                .iter()
                .map(|(t, b)| (*t, b.as_ptr() as *mut u8))
                .collect();
            let read = RwLockWriteGuard::downgrade(data);
            self.send_event(EventKind::Remove, &removed, &columns);
            self.send_event(EventKind::Exit, &removed, &columns);
            drop(read);
        }
        drained
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
