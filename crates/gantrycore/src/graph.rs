// gantry: a multi-language build system and test runner.
// Copyright (C) 2024 International Digital Economy Academy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// For inquiries, you can contact us via e-mail at jichuruanjian@idea.edu.cn.

//! The single source of truth for packages, targets and dependency edges.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use gantryutil::label::BuildLabel;
use petgraph::prelude::DiGraphMap;

use crate::error::BuildError;
use crate::package::Package;
use crate::target::{Target, TargetState};

/// Shared in-memory graph of packages and targets.
///
/// The graph-level locks guard only the address maps; packages and targets
/// carry their own locks, so concurrent readers and one writer per entity
/// are safe.
#[derive(Default)]
pub struct BuildGraph {
    targets: RwLock<HashMap<BuildLabel, Arc<Target>>>,
    packages: RwLock<HashMap<(String, String), Arc<Package>>>,
    /// Derived reverse index, rebuilt incrementally on each edge write.
    revdeps: RwLock<HashMap<BuildLabel, Vec<BuildLabel>>>,
    /// Broadcast for `wait_for_built` / `wait_for_package` observers.
    state_generation: Mutex<u64>,
    state_changed: Condvar,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a package, exactly once: if the package is already present the
    /// existing one is returned and the argument is discarded.
    pub fn add_package(&self, package: Arc<Package>) -> Arc<Package> {
        let mut packages = self.packages.write().unwrap();
        packages
            .entry(package.key())
            .or_insert(package)
            .clone()
    }

    pub fn package(&self, subrepo: &str, path: &str) -> Option<Arc<Package>> {
        self.packages
            .read()
            .unwrap()
            .get(&(subrepo.to_owned(), path.to_owned()))
            .cloned()
    }

    pub fn package_of(&self, label: &BuildLabel) -> Option<Arc<Package>> {
        self.package(&label.subrepo, &label.package)
    }

    pub fn packages(&self) -> Vec<Arc<Package>> {
        self.packages.read().unwrap().values().cloned().collect()
    }

    /// Insert a target into both its package and the graph's address map.
    pub fn add_target(
        &self,
        package: &Package,
        target: Target,
    ) -> Result<Arc<Target>, BuildError> {
        let label = target.label.clone();
        {
            let targets = self.targets.read().unwrap();
            if targets.contains_key(&label) {
                return Err(BuildError::AlreadyExists(label));
            }
        }
        let target = Arc::new(target);
        package.add_target(Arc::clone(&target))?;
        self.targets
            .write()
            .unwrap()
            .insert(label, Arc::clone(&target));
        self.notify_state_change();
        Ok(target)
    }

    pub fn target(&self, label: &BuildLabel) -> Option<Arc<Target>> {
        self.targets.read().unwrap().get(label).cloned()
    }

    /// Like [`BuildGraph::target`] but for callers holding an invariant that
    /// the target must exist; panics with the label if it does not.
    pub fn target_or_die(&self, label: &BuildLabel) -> Arc<Target> {
        self.target(label)
            .unwrap_or_else(|| panic!("target {label} is not in the graph"))
    }

    pub fn target_count(&self) -> usize {
        self.targets.read().unwrap().len()
    }

    /// Record the declared edge `from -> to`. The edge may dangle: `to`
    /// need not exist in the graph yet. Rejects edges that would close a
    /// dependency cycle.
    pub fn add_dependency(&self, from: &BuildLabel, to: BuildLabel) -> Result<(), BuildError> {
        let from_target = self.target(from).ok_or_else(|| BuildError::MissingTarget {
            label: from.clone(),
            suggestion: None,
        })?;
        if from_target.has_dep(&to) {
            return Ok(());
        }
        if let Some(cycle) = self.find_cycle(from, &to) {
            return Err(BuildError::DependencyCycle(cycle));
        }
        from_target.add_dep(to.clone());
        self.revdeps
            .write()
            .unwrap()
            .entry(to)
            .or_default()
            .push(from.clone());
        Ok(())
    }

    /// Labels that declared a dependency on `label`.
    pub fn rev_deps(&self, label: &BuildLabel) -> Vec<BuildLabel> {
        self.revdeps
            .read()
            .unwrap()
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    /// The dependencies of `target` after require/provide rerouting: a dep
    /// that provides languages resolves to the provided targets matching
    /// what `target` requires.
    pub fn resolved_deps(&self, target: &Target) -> Vec<BuildLabel> {
        let mut out = Vec::new();
        for dep in target.deps() {
            match self.target(&dep) {
                Some(dep_target) => {
                    for resolved in dep_target.provide_for(&target.requires) {
                        if !out.contains(&resolved) {
                            out.push(resolved);
                        }
                    }
                }
                None => {
                    if !out.contains(&dep) {
                        out.push(dep);
                    }
                }
            }
        }
        out
    }

    /// True iff every declared dependency resolves to a target that has
    /// reached `Built`.
    pub fn all_deps_built(&self, target: &Target) -> bool {
        self.resolved_deps(target).iter().all(|dep| {
            self.target(dep)
                .is_some_and(|t| t.state() == TargetState::Built)
        })
    }

    /// Expand `label` for a dependor: either the label itself, or every
    /// target of the package for an `:all` wildcard.
    pub fn dependent_targets(&self, _dependor: &BuildLabel, label: &BuildLabel) -> Vec<BuildLabel> {
        if label.is_all_targets() {
            if let Some(package) = self.package_of(label) {
                return package
                    .all_targets()
                    .into_iter()
                    .map(|t| t.label.clone())
                    .collect();
            }
        }
        vec![label.clone()]
    }

    /// Advance a target's state machine, waking any observers.
    pub fn cas_target(&self, target: &Target, expected: TargetState, next: TargetState) -> bool {
        let ok = target.cas(expected, next);
        if ok {
            self.notify_state_change();
        }
        ok
    }

    pub fn mark_package_parsed(&self, package: &Package) {
        package.mark_parsed();
        self.notify_state_change();
    }

    fn notify_state_change(&self) {
        let mut generation = self.state_generation.lock().unwrap();
        *generation += 1;
        self.state_changed.notify_all();
    }

    /// Block until the target reaches a terminal state, returning it.
    pub fn wait_for_built(&self, label: &BuildLabel) -> TargetState {
        let mut generation = self.state_generation.lock().unwrap();
        loop {
            if let Some(target) = self.target(label) {
                let state = target.state();
                if state.is_done() {
                    return state;
                }
            }
            generation = self.state_changed.wait(generation).unwrap();
        }
    }

    /// Block until the package owning `label` has finished parsing.
    pub fn wait_for_package(&self, label: &BuildLabel) -> Arc<Package> {
        let mut generation = self.state_generation.lock().unwrap();
        loop {
            if let Some(package) = self.package_of(label) {
                if package.is_parsed() {
                    return package;
                }
            }
            generation = self.state_changed.wait(generation).unwrap();
        }
    }

    /// The path the new edge `from -> to` would close into a cycle, if any.
    fn find_cycle(&self, from: &BuildLabel, to: &BuildLabel) -> Option<Vec<BuildLabel>> {
        let mut ids: HashMap<BuildLabel, u32> = HashMap::new();
        let mut by_id: Vec<BuildLabel> = Vec::new();
        let mut graph: DiGraphMap<u32, ()> = DiGraphMap::new();

        fn intern(
            label: BuildLabel,
            ids: &mut HashMap<BuildLabel, u32>,
            by_id: &mut Vec<BuildLabel>,
        ) -> u32 {
            if let Some(&id) = ids.get(&label) {
                return id;
            }
            let id = by_id.len() as u32;
            by_id.push(label.clone());
            ids.insert(label, id);
            id
        }

        {
            let targets = self.targets.read().unwrap();
            for (label, target) in targets.iter() {
                for dep in target.deps() {
                    let s = intern(label.clone(), &mut ids, &mut by_id);
                    let d = intern(dep, &mut ids, &mut by_id);
                    graph.add_edge(s, d, ());
                }
            }
        }
        let from_id = intern(from.clone(), &mut ids, &mut by_id);
        let to_id = intern(to.clone(), &mut ids, &mut by_id);
        graph.add_node(from_id);
        graph.add_node(to_id);

        let path = gantryutil::graph::path_between(&graph, to_id, from_id)?;
        let mut cycle = vec![from.clone()];
        cycle.extend(path.into_iter().map(|id| by_id[id as usize].clone()));
        Some(cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn graph_with_package(path: &str) -> (BuildGraph, Arc<Package>) {
        let graph = BuildGraph::new();
        let package = graph.add_package(Arc::new(Package::new(
            "",
            path,
            PathBuf::from(format!("{path}/BUILD.json")),
        )));
        (graph, package)
    }

    #[test]
    fn package_added_exactly_once() {
        let (graph, first) = graph_with_package("a");
        let again = graph.add_package(Arc::new(Package::new(
            "",
            "a",
            PathBuf::from("elsewhere/BUILD.json"),
        )));
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn cycles_are_rejected_with_a_path() {
        let (graph, package) = graph_with_package("a");
        graph
            .add_target(&package, Target::new(BuildLabel::new("a", "x")))
            .unwrap();
        graph
            .add_target(&package, Target::new(BuildLabel::new("a", "y")))
            .unwrap();
        graph
            .add_dependency(&BuildLabel::new("a", "x"), BuildLabel::new("a", "y"))
            .unwrap();
        let err = graph
            .add_dependency(&BuildLabel::new("a", "y"), BuildLabel::new("a", "x"))
            .unwrap_err();
        match err {
            BuildError::DependencyCycle(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 3);
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn dangling_edges_are_allowed() {
        let (graph, package) = graph_with_package("a");
        graph
            .add_target(&package, Target::new(BuildLabel::new("a", "x")))
            .unwrap();
        // //b:y is not in the graph yet.
        graph
            .add_dependency(&BuildLabel::new("a", "x"), BuildLabel::new("b", "y"))
            .unwrap();
        let t = graph.target_or_die(&BuildLabel::new("a", "x"));
        assert!(!graph.all_deps_built(&t));
        assert_eq!(
            graph.rev_deps(&BuildLabel::new("b", "y")),
            vec![BuildLabel::new("a", "x")]
        );
    }

    #[test]
    fn all_deps_built_follows_provides() {
        let (graph, package) = graph_with_package("a");
        let mut consumer = Target::new(BuildLabel::new("a", "bin"));
        consumer.requires.push("py".to_owned());
        let consumer = graph.add_target(&package, consumer).unwrap();

        let mut provider = Target::new(BuildLabel::new("a", "proto"));
        provider
            .provides
            .insert("py".to_owned(), BuildLabel::new("a", "proto_py"));
        graph.add_target(&package, provider).unwrap();
        let provided = graph
            .add_target(&package, Target::new(BuildLabel::new("a", "proto_py")))
            .unwrap();

        graph
            .add_dependency(&BuildLabel::new("a", "bin"), BuildLabel::new("a", "proto"))
            .unwrap();

        assert_eq!(
            graph.resolved_deps(&consumer),
            vec![BuildLabel::new("a", "proto_py")]
        );
        assert!(!graph.all_deps_built(&consumer));

        // Drive the provided target to Built; the provider itself stays put.
        assert!(provided.cas(TargetState::Inactive, TargetState::Semiactive));
        assert!(provided.cas(TargetState::Semiactive, TargetState::Active));
        assert!(provided.cas(TargetState::Active, TargetState::Pending));
        assert!(provided.cas(TargetState::Pending, TargetState::Building));
        assert!(graph.cas_target(&provided, TargetState::Building, TargetState::Built));
        assert!(graph.all_deps_built(&consumer));
    }

    #[test]
    fn observers_wake_on_state_changes() {
        let (graph, package) = graph_with_package("a");
        let graph = Arc::new(graph);
        let target = graph
            .add_target(&package, Target::new(BuildLabel::new("a", "x")))
            .unwrap();

        let waiter = {
            let graph = Arc::clone(&graph);
            std::thread::spawn(move || graph.wait_for_built(&BuildLabel::new("a", "x")))
        };
        let package_waiter = {
            let graph = Arc::clone(&graph);
            std::thread::spawn(move || graph.wait_for_package(&BuildLabel::new("a", "x")))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));

        assert!(target.cas(TargetState::Inactive, TargetState::Semiactive));
        assert!(target.cas(TargetState::Semiactive, TargetState::Active));
        assert!(target.cas(TargetState::Active, TargetState::Pending));
        assert!(target.cas(TargetState::Pending, TargetState::Building));
        assert!(graph.cas_target(&target, TargetState::Building, TargetState::Built));
        graph.mark_package_parsed(&package);

        assert_eq!(waiter.join().unwrap(), TargetState::Built);
        assert!(package_waiter.join().unwrap().is_parsed());
    }

    #[test]
    fn dependent_targets_expands_all() {
        let (graph, package) = graph_with_package("a");
        graph
            .add_target(&package, Target::new(BuildLabel::new("a", "x")))
            .unwrap();
        graph
            .add_target(&package, Target::new(BuildLabel::new("a", "y")))
            .unwrap();
        let all = graph.dependent_targets(
            &BuildLabel::original_target(),
            &BuildLabel::new("a", "all"),
        );
        assert_eq!(all.len(), 2);
        let one = graph.dependent_targets(
            &BuildLabel::original_target(),
            &BuildLabel::new("a", "x"),
        );
        assert_eq!(one, vec![BuildLabel::new("a", "x")]);
    }
}
