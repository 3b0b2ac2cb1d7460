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

//! Swarm ECS - archetype-based Entity Component System
//!
//! Entities are grouped by their exact component composition into columnar
//! archetypes, identified by generational handles, iterated through cached
//! queries, and mutated through deferred queues drained at tick. Four
//! lifecycle event channels (Create, Remove, Enter, Exit) notify observers
//! when entities enter or leave archetypes.
//!
//! ```
//! use swarm_ecs::World;
//!
//! #[derive(Clone, Copy)]
//! struct Position { x: f32, y: f32, z: f32 }
//!
//! let world = World::new();
//! let ids = world.entity().add(Position { x: 0.0, y: 1.0, z: 0.0 }).create(1);
//!
//! let query = world.query().include::<(Position,)>().compile();
//! query.each::<(&mut Position,), _>(|it, (pos,)| {
//!     assert_eq!(it.id, ids[0]);
//!     pos.x += 1.0;
//! });
//! ```

pub mod archetype;
pub mod builder;
pub mod component;
pub mod entity;
pub mod error;
pub mod handle;
pub mod observer;
pub mod query;
pub mod store;
pub mod system;
pub mod world;

// Re-exports for convenience
pub use archetype::{Archetype, ArchetypeId};
pub use builder::EntityBuilder;
pub use component::{Component, ComponentSet};
pub use entity::{Entity, EntityId, EntityRecord};
pub use error::{EcsError, Result};
pub use handle::{Handle, HandleTable};
pub use observer::{EventKind, ObserverBuilder};
pub use query::{Query, QueryDescriptor, QueryFactory, QueryFetch, QueryIter, UserMutex};
pub use store::ComponentStore;
pub use system::{System, SystemBuilder, SystemGraph, SystemId};
pub use world::World;

#[cfg(test)]
mod tests;
