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

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Stale or never-allocated entity handle
    InvalidHandle,

    /// Entity's archetype does not carry the requested component
    MissingComponent,

    /// Entity record points at an archetype that is not in the group map
    UnknownArchetype,

    /// System dependency cycle detected
    SystemCycleDetected,
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidHandle => write!(f, "Invalid entity handle"),
            EcsError::MissingComponent => write!(f, "Component not found on entity"),
            EcsError::UnknownArchetype => write!(f, "Archetype not found"),
            EcsError::SystemCycleDetected => write!(f, "System dependency cycle detected"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
