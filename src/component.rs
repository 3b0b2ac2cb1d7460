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

//! Component trait and component type sets
//!
//! Components are plain data attached to entities. The storage layer moves
//! them around with raw byte copies and never runs destructors, so the
//! `Component` bound requires `Copy`.

use std::any::TypeId;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use smallvec::SmallVec;

/// Maximum number of component types a set or query tuple can carry
pub const MAX_SET_COMPONENTS: usize = 8;

/// Marker trait for components.
///
/// Components must be trivially copyable and free of borrowed data. The
/// `Copy` bound is what lets columns relocate cells with memcpy.
pub trait Component: Copy + Send + Sync + 'static {}

/// Automatically implement Component for all valid types
impl<T: Copy + Send + Sync + 'static> Component for T {}

/// Stable 64-bit hash of a component type id
pub(crate) fn type_hash(type_id: TypeId) -> u64 {
    let mut hasher = FxHasher::default();
    type_id.hash(&mut hasher);
    hasher.finish()
}

/// A compile-time list of component types.
///
/// Used for the include and exclude sets of queries and observers. Always a
/// tuple, including for a single type: `(Position,)`.
pub trait ComponentSet: 'static {
    /// Type ids of every component in the set, in tuple order
    fn type_ids() -> SmallVec<[TypeId; MAX_SET_COMPONENTS]>;
}

macro_rules! impl_component_set {
    ($($T:ident),*) => {
        impl<$($T: Component),*> ComponentSet for ($($T,)*) {
            fn type_ids() -> SmallVec<[TypeId; MAX_SET_COMPONENTS]> {
                let mut ids = SmallVec::new();
                $(ids.push(TypeId::of::<$T>());)*
                ids
            }
        }
    };
}

impl_component_set!(A);
impl_component_set!(A, B);
impl_component_set!(A, B, C);
impl_component_set!(A, B, C, D);
impl_component_set!(A, B, C, D, E);
impl_component_set!(A, B, C, D, E, F);
impl_component_set!(A, B, C, D, E, F, G);
impl_component_set!(A, B, C, D, E, F, G, H);
