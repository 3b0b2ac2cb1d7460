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

//! Entity identifiers, location records and the guarded entity accessor

use std::any::TypeId;
use std::sync::Arc;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::Component;
use crate::error::Result;
use crate::world::World;

/// Stable generational entity identifier
pub type EntityId = crate::handle::Handle;

/// Entity location record, one per live entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRecord {
    /// Owning archetype
    pub group: ArchetypeId,
    /// Row index within the archetype's columns
    pub row: u32,
    /// Cleared on logical removal, before the handle slot is released
    pub alive: bool,
}

/// Read accessor for a single entity.
///
/// Holds the owning archetype's shared lock for its whole lifetime, which is
/// what makes the returned component references stable. Acquisition is
/// recursive, so an accessor may be created while the same archetype is
/// already being read (for example from inside a query callback).
///
/// Structural changes requested through an accessor are queued and applied
/// by the next [`World::tick`].
pub struct Entity<'w> {
    world: &'w World,
    group: Arc<Archetype>,
    id: EntityId,
    row: usize,
}

impl<'w> Entity<'w> {
    /// Lock the group and pin down the entity's row.
    ///
    /// Returns None if the entity moved out of `group` between the caller's
    /// record lookup and the lock acquisition; the caller retries.
    pub(crate) fn acquire(
        world: &'w World,
        group: Arc<Archetype>,
        id: EntityId,
    ) -> Option<Entity<'w>> {
        let guard = group.data.read_recursive();
        let record = *world.entities.read().get(id)?;
        if record.group != group.id() {
            return None;
        }
        let row = record.row as usize;
        debug_assert_eq!(guard.entities[row], id);

        // Keep the shared lock held for the accessor's lifetime; Drop
        // releases it.
        std::mem::forget(guard);
        Some(Entity {
            world,
            group,
            id,
            row,
        })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    fn data(&self) -> &crate::archetype::ArchetypeData {
        // Shared lock is held from `acquire` until Drop
        unsafe { &*self.group.data.data_ptr() }
    }

    /// Check if the entity has a component
    pub fn has<C: Component>(&self) -> bool {
        self.group.contains(TypeId::of::<C>())
    }

    /// Get a component of the entity
    pub fn get<C: Component>(&self) -> Option<&C> {
        let store = self.data().column(&TypeId::of::<C>())?;
        Some(unsafe { &*store.ptr(self.row).cast::<C>() })
    }

    /// Queue adding a component to the entity, applied at the next tick
    pub fn add<C: Component>(&self, component: C) -> Result<()> {
        self.world.add_component(self.id, component)
    }

    /// Queue removing a component from the entity, applied at the next tick
    pub fn remove<C: Component>(&self) -> Result<()> {
        self.world.remove_component::<C>(self.id)
    }
}

impl Drop for Entity<'_> {
    fn drop(&mut self) {
        // Pairs with the forgotten read guard in `acquire`
        unsafe { self.group.data.force_unlock_read() }
    }
}
