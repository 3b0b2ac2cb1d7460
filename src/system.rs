//! Systems and the system dependency graph
//!
//! A system is a query descriptor plus an iteration callback plus the set
//! of systems that must complete before it. The graph topologically orders
//! systems and detects cycles; scheduling independent systems across
//! threads is left to the embedding application.

use crate::component::ComponentSet;
use crate::error::{EcsError, Result};
use crate::query::{QueryDescriptor, QueryFetch, QueryIter, UserMutex};
use crate::world::World;

/// System identifier within a [`SystemGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub u32);

type SystemRunner = Box<dyn FnMut(&World, f32) + Send>;

/// A named query with an iteration callback
pub struct System {
    name: &'static str,
    descriptor: QueryDescriptor,
    runner: SystemRunner,
}

impl System {
    /// Start building a system
    pub fn builder(name: &'static str) -> SystemBuilder {
        SystemBuilder {
            name,
            descriptor: QueryDescriptor::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Component types the system's filter requires
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Run the system once over the world
    pub fn run(&mut self, world: &World, dt: f32) {
        (self.runner)(world, dt);
    }
}

/// Builder for systems, mirroring the query factory surface
pub struct SystemBuilder {
    name: &'static str,
    descriptor: QueryDescriptor,
}

impl SystemBuilder {
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

    /// Add a mutex locked around every callback invocation
    pub fn lock(mut self, mutex: &UserMutex) -> Self {
        self.descriptor.mutexes.push(mutex.clone());
        self
    }

    /// Finish the system with its per-entity callback
    pub fn each<D, F>(self, callback: F) -> System
    where
        D: QueryFetch + 'static,
        F: for<'a> FnMut(QueryIter<'a>, D::Item<'a>) + Send + 'static,
    {
        let descriptor = self.descriptor;
        let run_descriptor = descriptor.clone();
        let mut callback = callback;
        System {
            name: self.name,
            descriptor,
            runner: Box::new(move |world, dt| {
                world
                    .compile_descriptor(run_descriptor.clone())
                    .each_dt::<D, _>(dt, |iter, item| callback(iter, item));
            }),
        }
    }
}

/// Dependency graph over registered systems.
///
/// Edges say "runs after". `execution_order` returns a topological order of
/// the systems; independent systems are free to run concurrently as long as
/// each takes the archetype locks its query requires, but this crate only
/// ships the serial [`run`](SystemGraph::run).
#[derive(Default)]
pub struct SystemGraph {
    systems: Vec<System>,
    dependencies: Vec<Vec<usize>>,
}

impl SystemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a system
    pub fn add(&mut self, system: System) -> SystemId {
        let id = SystemId(self.systems.len() as u32);
        self.systems.push(system);
        self.dependencies.push(Vec::new());
        id
    }

    /// Declare that `system` must run after `dependency`
    pub fn after(&mut self, system: SystemId, dependency: SystemId) {
        let deps = &mut self.dependencies[system.0 as usize];
        if !deps.contains(&(dependency.0 as usize)) {
            deps.push(dependency.0 as usize);
        }
    }

    /// Declare that `system` must run before `dependent`
    pub fn before(&mut self, system: SystemId, dependent: SystemId) {
        self.after(dependent, system);
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Topologically order the systems by their dependency edges
    pub fn execution_order(&self) -> Result<Vec<SystemId>> {
        let count = self.systems.len();
        let mut indegree = vec![0usize; count];
        for (index, deps) in self.dependencies.iter().enumerate() {
            indegree[index] = deps.len();
        }

        let mut ready: Vec<usize> = (0..count).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);

        while let Some(index) = ready.pop() {
            order.push(SystemId(index as u32));
            for (dependent, deps) in self.dependencies.iter().enumerate() {
                if deps.contains(&index) {
                    indegree[dependent] -= 1;
                    if indegree[dependent] == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }

        if order.len() != count {
            return Err(EcsError::SystemCycleDetected);
        }
        Ok(order)
    }

    /// Run every system once, serially, in dependency order
    pub fn run(&mut self, world: &World, dt: f32) -> Result<()> {
        let order = self.execution_order()?;
        for id in order {
            self.systems[id.0 as usize].run(world, dt);
        }
        Ok(())
    }
}
