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

//! Entity builder
//!
//! Stages component values, resolves the target archetype from the staged
//! type set and batch-inserts the requested number of entities. If the
//! target archetype is write-locked (typically because the caller is inside
//! an iteration over it), the staged set is moved onto the world's deferred
//! queue instead and applied at the next tick.

use std::any::TypeId;
use std::ptr::NonNull;

use bumpalo::Bump;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::ColumnSpec;
use crate::component::Component;
use crate::entity::EntityId;
use crate::observer::EventKind;
use crate::query::QueryFetch;
use crate::world::World;

/// One staged component value, byte-copied into the arena
pub(crate) struct Staged {
    pub(crate) type_id: TypeId,
    pub(crate) size: usize,
    pub(crate) align: usize,
    pub(crate) ptr: NonNull<u8>,
}

/// Type-erased per-batch initialization callback. Receives the new ids and
/// the map from component type to the batch's column base pointer.
pub(crate) type InitFn = Box<dyn FnMut(&[EntityId], &FxHashMap<TypeId, *mut u8>) + Send>;

/// A creation request whose target archetype was contended; replayed by the
/// next tick with deferral disallowed.
pub(crate) struct DeferredCreate {
    /// Owns the staged bytes; chunk addresses are stable across moves
    pub(crate) arena: Bump,
    pub(crate) staged: Vec<Staged>,
    pub(crate) count: u32,
    pub(crate) on_create: Option<InitFn>,
}

// Staged pointers reference arena bytes of `Component` values, which are
// `Send + Sync` by trait bound.
unsafe impl Send for DeferredCreate {}

/// Utility used to create entities, obtained from [`World::entity`]
pub struct EntityBuilder<'w> {
    world: &'w World,
    arena: Bump,
    staged: Vec<Staged>,
    on_create: Option<InitFn>,
}

impl<'w> EntityBuilder<'w> {
    pub(crate) fn new(world: &'w World) -> Self {
        Self {
            world,
            arena: Bump::new(),
            staged: Vec::new(),
            on_create: None,
        }
    }

    /// Rebuild a builder from a deferred creation request so the tick can
    /// re-run it
    pub(crate) fn replay(world: &'w World, op: DeferredCreate) -> Self {
        Self {
            world,
            arena: op.arena,
            staged: op.staged,
            on_create: op.on_create,
        }
    }

    /// Stage a component value. Staging the same type twice overwrites the
    /// earlier value.
    pub fn add<C: Component>(mut self, component: C) -> Self {
        let type_id = TypeId::of::<C>();
        if let Some(staged) = self.staged.iter_mut().find(|s| s.type_id == type_id) {
            unsafe { staged.ptr.as_ptr().cast::<C>().write(component) };
            return self;
        }

        let slot = self.arena.alloc(component);
        self.staged.push(Staged {
            type_id,
            size: std::mem::size_of::<C>(),
            align: std::mem::align_of::<C>(),
            ptr: NonNull::from(slot).cast(),
        });
        self
    }

    /// Stage a tag component with its default value. Intended for zero-sized
    /// markers that only affect archetype membership.
    pub fn tag<T: Component + Default>(self) -> Self {
        self.add(T::default())
    }

    /// Create `count` entities from the staged components.
    ///
    /// Returns the new ids, or an empty list when nothing is staged or when
    /// the creation was deferred. Fires Create then Enter for the batch.
    pub fn create(self, count: u32) -> Vec<EntityId> {
        self.create_impl(count, true)
    }

    /// Create entities, invoking `callback` once per created entity with
    /// typed access to its freshly written components.
    ///
    /// The callback runs after the batch insert and before Create fires, so
    /// observers see its writes. On the deferred path it is carried along
    /// and replayed at tick.
    pub fn create_with<D, F>(mut self, callback: F, count: u32) -> Vec<EntityId>
    where
        D: QueryFetch + 'static,
        F: for<'a> FnMut(D::Item<'a>) + Send + 'static,
    {
        let mut callback = callback;
        self.on_create = Some(erase_init::<D, _>(move |_, item| callback(item)));
        self.create_impl(count, true)
    }

    /// Like [`create_with`](Self::create_with), also passing the entity's
    /// index within the batch
    pub fn create_with_index<D, F>(mut self, callback: F, count: u32) -> Vec<EntityId>
    where
        D: QueryFetch + 'static,
        F: for<'a> FnMut(usize, D::Item<'a>) + Send + 'static,
    {
        self.on_create = Some(erase_init::<D, _>(callback));
        self.create_impl(count, true)
    }

    pub(crate) fn create_impl(mut self, count: u32, allow_defer: bool) -> Vec<EntityId> {
        if self.staged.is_empty() || count == 0 {
            return Vec::new();
        }

        #[cfg(feature = "profiling")]
        let span = info_span!("world.create", components = self.staged.len(), count);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let specs: SmallVec<[ColumnSpec; 8]> = self
            .staged
            .iter()
            .map(|s| ColumnSpec {
                type_id: s.type_id,
                size: s.size,
                align: s.align,
            })
            .collect();
        let group = self.world.get_or_create_group(&specs);

        let mut data = if allow_defer {
            match group.data.try_write() {
                Some(guard) => guard,
                None => {
                    self.world.defer_create(DeferredCreate {
                        arena: self.arena,
                        staged: self.staged,
                        count,
                        on_create: self.on_create,
                    });
                    return Vec::new();
                }
            }
        } else {
            group.data.write()
        };

        let world = self.world;
        let (ids, columns) = world.insert_staged(&group, &mut data, &self.staged, count);

        if let Some(mut on_create) = self.on_create.take() {
            on_create(&ids, &columns);
        }

        // Events run under the read lock so callbacks can hand out column
        // access without racing the insert.
        let read = parking_lot::RwLockWriteGuard::downgrade(data);
        world.send_event(EventKind::Create, &ids, &columns);
        world.send_event(EventKind::Enter, &ids, &columns);
        drop(read);

        ids
    }
}

/// Wrap a typed per-entity callback into the erased batch form
pub(crate) fn erase_init<D, F>(mut callback: F) -> InitFn
where
    D: QueryFetch + 'static,
    F: for<'a> FnMut(usize, D::Item<'a>) + Send + 'static,
{
    Box::new(move |ids, columns| {
        let type_ids = D::type_ids();
        let mut bases: SmallVec<[NonNull<u8>; crate::component::MAX_SET_COMPONENTS]> =
            SmallVec::with_capacity(type_ids.len());
        for type_id in &type_ids {
            match columns.get(type_id) {
                Some(&base) => bases.push(unsafe { NonNull::new_unchecked(base) }),
                // Fetch of a type that was never staged; nothing sane to
                // pass, so skip the callback for the whole batch.
                None => return,
            }
        }
        for index in 0..ids.len() {
            callback(index, unsafe { D::fetch(&bases, index) });
        }
    })
}
