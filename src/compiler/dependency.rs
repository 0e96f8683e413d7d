//! Pass dependency graph derived from resource declarations.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::graph::{Access, PassDeclaration};
use crate::resource::{FnvBuildHasher, ResourceHandle};

/// Edges between passes, indexed by position in the declaration list.
#[derive(Debug, Clone, Default)]
pub(crate) struct DependencyGraph {
    /// `deps[i]` holds the passes that must run before pass `i`.
    deps: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Derive edges from the declarations, taken in declaration order.
    ///
    /// Per handle: a reader depends on the most recent earlier writer, a writer
    /// depends on the previous writer and on every reader since, and a reader
    /// declared before any writer depends on the first writer.
    pub(crate) fn build(declarations: &[&PassDeclaration]) -> Self {
        let mut deps = vec![BTreeSet::new(); declarations.len()];

        let mut accesses: HashMap<ResourceHandle, Vec<(usize, Access)>, FnvBuildHasher> =
            HashMap::default();
        for (index, declaration) in declarations.iter().enumerate() {
            for resource in &declaration.resources {
                accesses
                    .entry(resource.handle)
                    .or_default()
                    .push((index, resource.access));
            }
        }

        for users in accesses.values() {
            let mut last_writer: Option<usize> = None;
            let mut early_readers: Vec<usize> = Vec::new();
            let mut readers_since_write: Vec<usize> = Vec::new();

            for &(pass, access) in users {
                if access.is_read() {
                    match last_writer {
                        Some(writer) if writer != pass => {
                            deps[pass].insert(writer);
                        }
                        Some(_) => {}
                        None => early_readers.push(pass),
                    }
                    readers_since_write.push(pass);
                }
                if access.is_write() {
                    match last_writer {
                        Some(writer) => {
                            if writer != pass {
                                deps[pass].insert(writer);
                            }
                            for &reader in &readers_since_write {
                                if reader != pass {
                                    deps[pass].insert(reader);
                                }
                            }
                        }
                        None => {
                            for reader in early_readers.drain(..) {
                                if reader != pass {
                                    deps[reader].insert(pass);
                                }
                            }
                        }
                    }
                    last_writer = Some(pass);
                    readers_since_write.clear();
                }
            }
        }

        Self { deps }
    }

    pub(crate) fn len(&self) -> usize {
        self.deps.len()
    }

    /// Passes `pass` directly depends on.
    pub(crate) fn dependencies(&self, pass: usize) -> impl Iterator<Item = usize> + '_ {
        self.deps[pass].iter().copied()
    }

    /// Topological order, breaking ties by declaration index.
    ///
    /// Returns the passes forming a cycle, in execution order, on failure.
    pub(crate) fn topological_order(&self) -> Result<Vec<usize>, Vec<usize>> {
        let n = self.deps.len();
        let mut in_degree: Vec<usize> = self.deps.iter().map(BTreeSet::len).collect();
        let mut dependents = vec![Vec::new(); n];
        for (pass, deps) in self.deps.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(pass);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&pass| in_degree[pass] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(pass)) = ready.pop() {
            order.push(pass);
            for &dependent in &dependents[pass] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            Err(self.find_cycle(&in_degree))
        }
    }

    /// Walk dependencies among unsorted passes until one repeats.
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<usize> {
        let remaining = |pass: usize| in_degree[pass] > 0;
        let Some(start) = (0..self.deps.len()).find(|&pass| remaining(pass)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            // Every unsorted pass still waits on at least one unsorted pass.
            let Some(next) = self.deps[current].iter().copied().find(|&d| remaining(d)) else {
                return path;
            };
            if let Some(pos) = path.iter().position(|&p| p == next) {
                let mut cycle = path.split_off(pos);
                cycle.reverse();
                return cycle;
            }
            path.push(next);
            current = next;
        }
    }

    /// Passes `root` transitively depends on, including `root` itself.
    pub(crate) fn reachable_from(&self, root: usize) -> Vec<bool> {
        let mut reachable = vec![false; self.deps.len()];
        let mut stack = vec![root];
        while let Some(pass) = stack.pop() {
            if std::mem::replace(&mut reachable[pass], true) {
                continue;
            }
            stack.extend(self.deps[pass].iter().copied().filter(|&d| !reachable[d]));
        }
        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceDeclaration;
    use crate::resource::{BufferInfo, ResourceInfo};

    fn decl(uses: &[(&str, Access)]) -> PassDeclaration {
        PassDeclaration {
            resources: uses
                .iter()
                .map(|&(name, access)| ResourceDeclaration {
                    handle: ResourceHandle::buffer(name),
                    info: ResourceInfo::Buffer(BufferInfo::new(16)),
                    access,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn graph(passes: &[PassDeclaration]) -> DependencyGraph {
        let refs: Vec<&PassDeclaration> = passes.iter().collect();
        DependencyGraph::build(&refs)
    }

    fn deps_of(graph: &DependencyGraph, pass: usize) -> Vec<usize> {
        graph.dependencies(pass).collect()
    }

    #[test]
    fn test_read_after_write() {
        let g = graph(&[decl(&[("b", Access::Write)]), decl(&[("b", Access::Read)])]);
        assert_eq!(deps_of(&g, 1), [0]);
        assert!(deps_of(&g, 0).is_empty());
        assert_eq!(g.topological_order().unwrap(), [0, 1]);
    }

    #[test]
    fn test_reader_declared_before_writer() {
        let g = graph(&[decl(&[("b", Access::Read)]), decl(&[("b", Access::Write)])]);
        assert_eq!(deps_of(&g, 0), [1]);
        assert_eq!(g.topological_order().unwrap(), [1, 0]);
    }

    #[test]
    fn test_write_after_read_and_write() {
        let g = graph(&[
            decl(&[("b", Access::Write)]),
            decl(&[("b", Access::Read)]),
            decl(&[("b", Access::Write)]),
            decl(&[("b", Access::Read)]),
        ]);
        assert_eq!(deps_of(&g, 2), [0, 1]);
        assert_eq!(deps_of(&g, 3), [2]);
        assert_eq!(g.topological_order().unwrap(), [0, 1, 2, 3]);
    }

    #[test]
    fn test_independent_passes_keep_declaration_order() {
        let g = graph(&[
            decl(&[("a", Access::Write)]),
            decl(&[("b", Access::Write)]),
            decl(&[("c", Access::Write)]),
        ]);
        assert_eq!(g.topological_order().unwrap(), [0, 1, 2]);
    }

    #[test]
    fn test_cycle_is_reported() {
        // 0 writes x which 1 reads; 1 writes y which 0 reads.
        let g = graph(&[
            decl(&[("x", Access::Write), ("y", Access::Read)]),
            decl(&[("x", Access::Read), ("y", Access::Write)]),
        ]);
        let cycle = g.topological_order().unwrap_err();
        assert_eq!(cycle.len(), 2);
        assert!(cycle.contains(&0) && cycle.contains(&1));
    }

    #[test]
    fn test_reachability() {
        let g = graph(&[
            decl(&[("a", Access::Write)]),
            decl(&[("c", Access::Write)]),
            decl(&[("a", Access::Read)]),
        ]);
        assert_eq!(g.reachable_from(2), [true, false, true]);
    }
}
