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

//! Archetype storage: one columnar table per distinct component composition

use std::any::TypeId;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::component::type_hash;
use crate::entity::EntityId;
use crate::store::ComponentStore;

/// Stable archetype identifier derived from the component-type set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u64);

/// Order-invariant hash of a component-type set.
///
/// Per-type hashes are combined with wrapping addition, so any permutation
/// of the same set produces the same id. Good enough for the expected type
/// counts (well under 64 per archetype).
pub fn archetype_hash(types: &[TypeId]) -> ArchetypeId {
    let mut hash = 0u64;
    for &type_id in types {
        hash = hash.wrapping_add(type_hash(type_id));
    }
    ArchetypeId(hash)
}

/// Column layout request used when an archetype is first created
#[derive(Debug, Clone, Copy)]
pub(crate) struct ColumnSpec {
    pub type_id: TypeId,
    pub size: usize,
    pub align: usize,
}

/// Row storage of an archetype: the columns plus the resident entity list.
///
/// Every column has the same length and that length equals `entities.len()`;
/// all row mutations go through the owning archetype's lock and mutate the
/// columns and the entity list together.
pub struct ArchetypeData {
    pub(crate) columns: FxHashMap<TypeId, ComponentStore>,
    pub(crate) entities: Vec<EntityId>,
}

impl ArchetypeData {
    /// Get a column by component type
    pub fn column(&self, type_id: &TypeId) -> Option<&ComponentStore> {
        self.columns.get(type_id)
    }

    /// Get a column mutably by component type
    pub fn column_mut(&mut self, type_id: &TypeId) -> Option<&mut ComponentStore> {
        self.columns.get_mut(type_id)
    }

    /// Resident entities, position equals row index
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Number of resident rows
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub(crate) fn assert_columns_parallel(&self) {
        debug_assert!(
            self.columns.values().all(|c| c.len() == self.entities.len()),
            "column lengths diverged from entity list"
        );
    }
}

/// A group of entities sharing one exact component composition.
///
/// The row data sits behind a reader/writer lock: readers are query
/// iteration and event dispatch, writers are row insertion and swap-pop
/// removal. The remove queue is separate so removal requests issued during
/// iteration only append, without touching the row lock.
pub struct Archetype {
    id: ArchetypeId,
    /// Creation sequence number, used to keep cached query lists in
    /// archetype creation order
    seq: u32,
    /// Sorted component-type signature; fixed at creation
    types: Vec<TypeId>,
    pub(crate) data: RwLock<ArchetypeData>,
    pub(crate) remove_queue: Mutex<Vec<EntityId>>,
}

impl Archetype {
    pub(crate) fn new(id: ArchetypeId, seq: u32, specs: &[ColumnSpec]) -> Self {
        let mut columns = FxHashMap::default();
        let mut types: Vec<TypeId> = Vec::with_capacity(specs.len());
        for spec in specs {
            columns.insert(spec.type_id, ComponentStore::new(spec.size, spec.align));
            types.push(spec.type_id);
        }
        types.sort();
        debug_assert_eq!(types.len(), columns.len(), "duplicate column spec");

        Self {
            id,
            seq,
            types,
            data: RwLock::new(ArchetypeData {
                columns,
                entities: Vec::new(),
            }),
            remove_queue: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub(crate) fn seq(&self) -> u32 {
        self.seq
    }

    /// Sorted component-type signature
    pub fn types(&self) -> &[TypeId] {
        &self.types
    }

    /// Check whether this archetype's composition carries a component type
    pub fn contains(&self, type_id: TypeId) -> bool {
        self.types.binary_search(&type_id).is_ok()
    }
}
