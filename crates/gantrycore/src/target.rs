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

//! Build targets and their lifecycle state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use gantryutil::label::BuildLabel;

use crate::coverage::TestCoverage;
use crate::error::BuildError;
use crate::results::TestSuite;

/// Lifecycle states of a target. Transitions are strictly monotonic in the
/// numeric order below; [`Target::cas`] is the only way a state advances.
///
/// `Semiactive` means "will build only if something actually needs to
/// build"; `Active` means "must build". `Stopped`, `Built` and `Failed` are
/// terminal siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TargetState {
    Inactive = 0,
    Semiactive = 1,
    Active = 2,
    Pending = 3,
    Building = 4,
    Stopped = 5,
    Built = 6,
    Failed = 7,
}

impl TargetState {
    pub fn from_u8(v: u8) -> TargetState {
        match v {
            0 => TargetState::Inactive,
            1 => TargetState::Semiactive,
            2 => TargetState::Active,
            3 => TargetState::Pending,
            4 => TargetState::Building,
            5 => TargetState::Stopped,
            6 => TargetState::Built,
            _ => TargetState::Failed,
        }
    }

    /// True once the target has reached a terminal state.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TargetState::Stopped | TargetState::Built | TargetState::Failed
        )
    }
}

/// A declared node in the build graph; the unit of building and testing.
///
/// The declaration fields are filled in while the owning package parses (or
/// inside a post-build callback, under the package lock) and are frozen once
/// the target is added to the graph; runtime state lives behind interior
/// mutability.
#[derive(Debug)]
pub struct Target {
    pub label: BuildLabel,
    state: AtomicU8,

    /// Source paths, relative to the package directory.
    pub srcs: Vec<String>,
    /// Declared output files, relative to the target's out directory.
    pub outs: Vec<String>,
    pub command: String,
    pub test_command: String,
    /// Free-form labels, consumed by tag filters and the limiter.
    pub labels: Vec<String>,
    pub is_test: bool,
    pub is_binary: bool,
    pub test_only: bool,
    pub no_test_output: bool,
    /// Always run on a local worker, never a remote executor.
    pub local: bool,
    /// How many times a test may be retried before it is deemed failed.
    pub flakiness: u32,
    pub build_timeout: Option<Duration>,
    pub test_timeout: Option<Duration>,
    /// Languages this target consumes from its dependencies.
    pub requires: Vec<String>,
    /// Language -> target this one offers in place of itself.
    pub provides: HashMap<String, BuildLabel>,
    pub has_pre_build: bool,
    pub has_post_build: bool,

    deps: RwLock<Vec<BuildLabel>>,
    failure: Mutex<Option<BuildError>>,
    results: Mutex<Option<TestSuite>>,
    coverage: Mutex<Option<TestCoverage>>,
    runtime_hash: Mutex<Option<String>>,
}

impl Target {
    pub fn new(label: BuildLabel) -> Self {
        Target {
            label,
            state: AtomicU8::new(TargetState::Inactive as u8),
            srcs: Vec::new(),
            outs: Vec::new(),
            command: String::new(),
            test_command: String::new(),
            labels: Vec::new(),
            is_test: false,
            is_binary: false,
            test_only: false,
            no_test_output: false,
            local: false,
            flakiness: 0,
            build_timeout: None,
            test_timeout: None,
            requires: Vec::new(),
            provides: HashMap::new(),
            has_pre_build: false,
            has_post_build: false,
            deps: RwLock::new(Vec::new()),
            failure: Mutex::new(None),
            results: Mutex::new(None),
            coverage: Mutex::new(None),
            runtime_hash: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TargetState {
        TargetState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state machine. Fails (returns false) when the current
    /// state is not `expected` or when the transition would move backwards.
    pub fn cas(&self, expected: TargetState, next: TargetState) -> bool {
        if next <= expected {
            return false;
        }
        self.state
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn deps(&self) -> Vec<BuildLabel> {
        self.deps.read().unwrap().clone()
    }

    /// Record a declared dependency. Idempotent.
    pub fn add_dep(&self, dep: BuildLabel) {
        let mut deps = self.deps.write().unwrap();
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }

    pub fn has_dep(&self, dep: &BuildLabel) -> bool {
        self.deps.read().unwrap().contains(dep)
    }

    /// Resolve this target for a dependor with the given `requires` set.
    ///
    /// A target that provides nothing (or a dependor that requires nothing)
    /// stands for itself. Otherwise each required language maps through the
    /// provides table, falling back to this target for languages it does not
    /// provide.
    pub fn provide_for(&self, requires: &[String]) -> Vec<BuildLabel> {
        if self.provides.is_empty() || requires.is_empty() {
            return vec![self.label.clone()];
        }
        let mut out = Vec::new();
        for r in requires {
            let provided = self.provides.get(r).unwrap_or(&self.label);
            if !out.contains(provided) {
                out.push(provided.clone());
            }
        }
        out
    }

    pub fn set_failure(&self, err: BuildError) {
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    pub fn failure(&self) -> Option<BuildError> {
        self.failure.lock().unwrap().clone()
    }

    /// Store the per-run test results. Written exactly once per run by the
    /// worker that executed the test.
    pub fn set_results(&self, suite: TestSuite) {
        let mut results = self.results.lock().unwrap();
        debug_assert!(results.is_none(), "test results written twice");
        *results = Some(suite);
    }

    pub fn results(&self) -> Option<TestSuite> {
        self.results.lock().unwrap().clone()
    }

    pub fn set_coverage(&self, coverage: TestCoverage) {
        *self.coverage.lock().unwrap() = Some(coverage);
    }

    pub fn coverage(&self) -> Option<TestCoverage> {
        self.coverage.lock().unwrap().clone()
    }

    pub fn set_runtime_hash(&self, hash: String) {
        *self.runtime_hash.lock().unwrap() = Some(hash);
    }

    pub fn runtime_hash(&self) -> Option<String> {
        self.runtime_hash.lock().unwrap().clone()
    }

    /// True when this target carries any of the given tag labels.
    pub fn has_any_label(&self, labels: &[String]) -> bool {
        labels.iter().any(|l| self.labels.iter().any(|t| t == l))
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|t| t == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_is_monotonic() {
        let t = Target::new(BuildLabel::new("a", "x"));
        assert_eq!(t.state(), TargetState::Inactive);
        assert!(t.cas(TargetState::Inactive, TargetState::Semiactive));
        assert!(t.cas(TargetState::Semiactive, TargetState::Active));
        // Wrong expected state.
        assert!(!t.cas(TargetState::Inactive, TargetState::Active));
        // Backwards transition is refused outright.
        assert!(!t.cas(TargetState::Active, TargetState::Semiactive));
        assert!(t.cas(TargetState::Active, TargetState::Pending));
        assert!(t.cas(TargetState::Pending, TargetState::Building));
        assert!(t.cas(TargetState::Building, TargetState::Built));
        assert!(t.is_done());
    }

    #[test]
    fn provide_for_reroutes() {
        let mut t = Target::new(BuildLabel::new("proto", "grpc"));
        t.provides.insert(
            "py".to_owned(),
            BuildLabel::new("proto", "grpc_py"),
        );
        assert_eq!(
            t.provide_for(&["py".to_owned()]),
            vec![BuildLabel::new("proto", "grpc_py")]
        );
        // Unprovided languages fall back to the target itself.
        assert_eq!(
            t.provide_for(&["go".to_owned()]),
            vec![BuildLabel::new("proto", "grpc")]
        );
        // No requires at all: the target stands for itself.
        assert_eq!(t.provide_for(&[]), vec![BuildLabel::new("proto", "grpc")]);
    }

    #[test]
    fn first_failure_sticks() {
        let t = Target::new(BuildLabel::new("a", "x"));
        t.set_failure(BuildError::DependencyFailed(BuildLabel::new("b", "y")));
        t.set_failure(BuildError::WorkerCrashed("later".to_owned()));
        assert_eq!(
            t.failure(),
            Some(BuildError::DependencyFailed(BuildLabel::new("b", "y")))
        );
    }
}
