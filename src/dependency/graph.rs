use crate::model::SchemaObjectRef;
use std::collections::{HashMap, HashSet, VecDeque};

/// In-memory bidirectional dependency graph (spec.md §4.4).
///
/// `forward[x]` is what `x` depends on; `reverse[x]` is what depends on
/// `x`. Both sides are replaced atomically per object by
/// [`DependencyGraph::set_dependencies`] — spec.md §3 is explicit that
/// "edges are reset wholesale per object on each dependency refresh (no
/// partial merges)".
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    forward: HashMap<SchemaObjectRef, HashSet<SchemaObjectRef>>,
    reverse: HashMap<SchemaObjectRef, HashSet<SchemaObjectRef>>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all outgoing edges of `object_ref` with `dependencies`,
    /// keeping `reverse` consistent. Old dependencies no longer present
    /// have their back-edge removed; new ones gain one.
    pub fn set_dependencies(&mut self, object_ref: SchemaObjectRef, dependencies: HashSet<SchemaObjectRef>) {
        if let Some(old) = self.forward.remove(&object_ref) {
            for dep in &old {
                if let Some(dependents) = self.reverse.get_mut(dep) {
                    dependents.remove(&object_ref);
                }
            }
        }
        for dep in &dependencies {
            self.reverse.entry(dep.clone()).or_default().insert(object_ref.clone());
        }
        self.forward.insert(object_ref, dependencies);
    }

    /// Direct dependents of `object_ref` (one hop).
    #[must_use]
    pub fn dependents(&self, object_ref: &SchemaObjectRef) -> HashSet<SchemaObjectRef> {
        self.reverse.get(object_ref).cloned().unwrap_or_default()
    }

    /// All transitive dependents of `object_ref`, via BFS with a visited
    /// set — cycle-safe and finite even in a cyclic graph (spec.md §4.4).
    /// `object_ref` itself is never included in the result.
    #[must_use]
    pub fn transitive_dependents(&self, object_ref: &SchemaObjectRef) -> HashSet<SchemaObjectRef> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(object_ref.clone());
        let mut result = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for dependent in self.dependents(&current) {
                if result.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        result
    }

    /// Removes `object_ref` and every edge touching it, in either
    /// direction.
    pub fn remove(&mut self, object_ref: &SchemaObjectRef) {
        if let Some(deps) = self.forward.remove(object_ref) {
            for dep in deps {
                if let Some(dependents) = self.reverse.get_mut(&dep) {
                    dependents.remove(object_ref);
                }
            }
        }
        if let Some(dependents) = self.reverse.remove(object_ref) {
            for dependent in dependents {
                if let Some(deps) = self.forward.get_mut(&dependent) {
                    deps.remove(object_ref);
                }
            }
        }
    }
}
