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

//! The central loop turning label requests into parse, build and test
//! tasks, respecting dependency readiness and deferrals.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gantrycore::bus::Status;
use gantrycore::cache::Cache;
use gantrycore::error::BuildError;
use gantrycore::execute::Executor;
use gantrycore::package::Package;
use gantrycore::parse::{Parser, ParseOutcome};
use gantrycore::results::ResultReader;
use gantrycore::state::BuildState;
use gantrycore::target::{Target, TargetState};
use gantryutil::label::BuildLabel;
use gantryutil::suggest::suggest_targets;
use log::{debug, warn};
use tracing::trace;

use crate::defer::{Deferral, DeferRegistry, Registered, is_undefer, undefer_label};
use crate::limiter::Limiter;
use crate::queue::{Task, TaskQueue};

/// How an activation request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Build the label itself without pulling in its dependencies.
    NoDeps,
    /// Only make sure the package parses; build nothing unless someone
    /// else needs it.
    ForParseOnly,
}

/// Targets carrying this label are never selected by `:all` expansion.
const MANUAL_LABEL: &str = "manual";

/// The scheduler: owns the task queue, the deferral registry and the
/// capability handles, and coordinates every worker.
pub struct Scheduler {
    pub state: Arc<BuildState>,
    pub queue: TaskQueue,
    pub defers: DeferRegistry,
    pub limiter: Limiter,
    pub parser: Arc<dyn Parser>,
    pub executor: Arc<dyn Executor>,
    pub reader: Arc<dyn ResultReader>,
    pub cache: Option<Arc<dyn Cache>>,

    /// Tasks popped but not yet finished; part of the termination condition.
    in_flight: AtomicUsize,
    /// Labels that some parse is (transitively) blocked on; their build
    /// tasks are escalated to subinclude priority.
    subinclude_needed: Mutex<HashSet<BuildLabel>>,
    /// Failures not attached to any graph target (missing targets, failed
    /// parses); folded into the final summary.
    hard_failures: Mutex<Vec<BuildError>>,
}

impl Scheduler {
    pub fn new(
        state: Arc<BuildState>,
        parser: Arc<dyn Parser>,
        executor: Arc<dyn Executor>,
        reader: Arc<dyn ResultReader>,
        cache: Option<Arc<dyn Cache>>,
    ) -> Arc<Self> {
        let limiter = Limiter::new(&state.options.limits);
        Arc::new(Scheduler {
            state,
            queue: TaskQueue::new(),
            defers: DeferRegistry::new(),
            limiter,
            parser,
            executor,
            reader,
            cache,
            in_flight: AtomicUsize::new(0),
            subinclude_needed: Mutex::new(HashSet::new()),
            hard_failures: Mutex::new(Vec::new()),
        })
    }

    /// The one entry point for "please handle this label". Idempotent.
    pub fn activate(&self, tid: i32, label: BuildLabel, dependor: BuildLabel, mode: Mode) {
        if label.is_recursive() {
            self.expand_recursive(tid, &label, &dependor, mode);
        } else {
            self.activate_inner(tid, label, dependor, mode, false);
        }
    }

    /// Walk the source tree under the label's package and activate `:all`
    /// for every package found.
    fn expand_recursive(&self, tid: i32, label: &BuildLabel, dependor: &BuildLabel, mode: Mode) {
        let root = self.state.package_dir(&label.package);
        let out_dir = self.state.out_dir();
        let names = &self.state.options.build_file_names;
        let mut found = false;
        for entry in walkdir::WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.path() != out_dir)
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if !names.iter().any(|n| *n == file_name) {
                continue;
            }
            let dir = entry.path().parent().unwrap_or(&root);
            let package = dir
                .strip_prefix(&self.state.options.root)
                .unwrap_or(dir)
                .to_string_lossy()
                .replace('\\', "/");
            found = true;
            self.activate_inner(
                tid,
                BuildLabel::with_subrepo(label.subrepo.clone(), package, "all"),
                dependor.clone(),
                mode,
                false,
            );
        }
        if !found {
            self.record_failure(
                tid,
                label.clone(),
                BuildError::ParseFailed {
                    package: label.package.clone(),
                    reason: "no packages found under this path".to_owned(),
                },
            );
        }
    }

    pub(crate) fn activate_inner(
        &self,
        tid: i32,
        label: BuildLabel,
        dependor: BuildLabel,
        mode: Mode,
        subinclude: bool,
    ) {
        if self.queue.is_closed() {
            return;
        }
        trace!("activate {} (dependor {}, {:?})", label, dependor, mode);
        if self.state.graph.package_of(&label).is_some() {
            self.activate_target(tid, &label, &dependor, mode, subinclude);
            return;
        }
        match self
            .defers
            .register_pending(&label, dependor.clone(), mode, subinclude)
        {
            Registered::FirstToParse => {
                self.queue.push(Task::Parse {
                    package: label.package_label(),
                    dependor,
                    subinclude,
                });
            }
            Registered::Attached => {
                debug!("{} attached to the pending parse of its package", label);
            }
        }
    }

    /// Activate a label whose package has already parsed.
    fn activate_target(
        &self,
        tid: i32,
        label: &BuildLabel,
        dependor: &BuildLabel,
        mode: Mode,
        subinclude: bool,
    ) {
        let Some(package) = self.state.graph.package_of(label) else {
            return;
        };
        if label.is_all_targets() {
            for target in package.all_targets() {
                if self.should_include(&target) {
                    self.activate_single(tid, target, dependor, mode, subinclude);
                }
            }
            return;
        }
        match package.target(&label.name) {
            Some(target) => self.activate_single(tid, target, dependor, mode, subinclude),
            None => {
                let names = package.target_names();
                let suggestion = suggest_targets(&label.name, &names);
                self.record_failure(
                    tid,
                    label.clone(),
                    BuildError::MissingTarget {
                        label: label.clone(),
                        suggestion,
                    },
                );
            }
        }
    }

    /// Tag filtering for wildcard expansion: exclude beats include, and
    /// `manual` targets are never auto-selected.
    fn should_include(&self, target: &Target) -> bool {
        let options = &self.state.options;
        if target.has_label(MANUAL_LABEL) {
            return false;
        }
        if target.has_any_label(&options.exclude) {
            return false;
        }
        if !options.include.is_empty() && !target.has_any_label(&options.include) {
            return false;
        }
        if target.test_only && !options.need_tests {
            return false;
        }
        true
    }

    fn activate_single(
        &self,
        tid: i32,
        target: Arc<Target>,
        dependor: &BuildLabel,
        mode: Mode,
        subinclude: bool,
    ) {
        let graph = &self.state.graph;

        // require/provide rerouting: a dependency that provides the
        // dependor's required languages resolves to the provided targets.
        if let Some(dependor_target) = graph.target(dependor) {
            if !target.provides.is_empty() && !dependor_target.requires.is_empty() {
                let provided = target.provide_for(&dependor_target.requires);
                let mut keep_self = false;
                for p in &provided {
                    if *p == target.label {
                        keep_self = true;
                        continue;
                    }
                    // Rerouted deps become real edges so readiness and
                    // reverse-dependency rescans see them.
                    if let Err(e) = graph.add_dependency(dependor, p.clone()) {
                        self.record_failure(tid, p.clone(), e);
                        return;
                    }
                    self.activate_inner(tid, p.clone(), dependor.clone(), mode, subinclude);
                }
                if !keep_self {
                    return;
                }
            }
        }

        if subinclude {
            let newly = self
                .subinclude_needed
                .lock()
                .unwrap()
                .insert(target.label.clone());
            // A build task already queued at ordinary priority gets a
            // duplicate at subinclude priority; the Pending -> Building
            // guard drops whichever arrives second.
            if newly && target.state() == TargetState::Pending {
                self.queue.push(Task::Build {
                    label: target.label.clone(),
                    subinclude: true,
                });
            }
        }

        graph.cas_target(&target, TargetState::Inactive, TargetState::Semiactive);

        let needs_build = mode != Mode::ForParseOnly
            && (self.state.options.need_build || self.state.options.need_tests || subinclude);
        if !needs_build {
            return;
        }

        if graph.cas_target(&target, TargetState::Semiactive, TargetState::Active) {
            // Tests cost twice so progress reflects both build and test.
            let cost = if self.will_test(&target) { 2 } else { 1 };
            self.state.add_active(cost);
        }

        if mode != Mode::NoDeps {
            for dep in graph.resolved_deps(&target) {
                self.activate_inner(tid, dep, target.label.clone(), Mode::Normal, subinclude);
            }
        }
        self.check_ready(&target, mode == Mode::NoDeps);
    }

    pub(crate) fn will_test(&self, target: &Target) -> bool {
        target.is_test && self.state.options.need_tests
    }

    /// Move an `Active` target whose dependencies are all built to
    /// `Pending` and enqueue its build.
    pub(crate) fn check_ready(&self, target: &Target, ignore_deps: bool) {
        let graph = &self.state.graph;
        if target.state() != TargetState::Active {
            return;
        }
        if !ignore_deps && !graph.all_deps_built(target) {
            return;
        }
        if graph.cas_target(target, TargetState::Active, TargetState::Pending) {
            self.queue.push(Task::Build {
                label: target.label.clone(),
                subinclude: self.is_subinclude_needed(&target.label),
            });
        }
    }

    pub(crate) fn is_subinclude_needed(&self, label: &BuildLabel) -> bool {
        self.subinclude_needed.lock().unwrap().contains(label)
    }

    // ------ parsing ------

    pub(crate) fn handle_parse(
        &self,
        tid: i32,
        package_label: BuildLabel,
        dependor: BuildLabel,
        _subinclude: bool,
    ) {
        if self.state.graph.package_of(&package_label).is_some() {
            // Someone parsed it already; just drain any stragglers.
            self.drain_pending(tid, &package_label);
            return;
        }
        if is_undefer(&dependor) {
            debug!("retrying deferred parse of {}", package_label);
        }
        self.state.publish_status(
            tid,
            package_label.clone(),
            Status::Parsing,
            "Parsing...",
        );

        let dir = self.state.package_dir(&package_label.package);
        let filename = self
            .state
            .options
            .build_file_names
            .iter()
            .map(|n| dir.join(n))
            .find(|p| p.is_file());
        let Some(filename) = filename else {
            self.parse_failed(
                tid,
                &package_label,
                BuildError::ParseFailed {
                    package: package_label.package.clone(),
                    reason: format!("no build file found in {}", dir.display()),
                },
            );
            return;
        };

        let package = Arc::new(Package::new(
            package_label.subrepo.clone(),
            package_label.package.clone(),
            filename.clone(),
        ));
        match self.parser.parse_file(&self.state, &package, &filename) {
            Ok(ParseOutcome::Done) => {
                let package = self.state.graph.add_package(package);
                self.state.graph.mark_package_parsed(&package);
                self.state.publish_status(
                    tid,
                    package_label.clone(),
                    Status::Parsed,
                    format!("Parsed ({} targets)", package.target_names().len()),
                );
                self.drain_pending(tid, &package_label);
            }
            Ok(ParseOutcome::Deferred(sub_label)) => {
                debug!(
                    "parse of {} deferred on subinclude {}",
                    package_label, sub_label
                );
                match self
                    .defers
                    .add_deferred_parse(sub_label.clone(), package_label.clone())
                {
                    Deferral::Deferred => {
                        // Escalated so it beats ordinary work.
                        self.activate_inner(
                            tid,
                            sub_label,
                            package_label.clone(),
                            Mode::Normal,
                            true,
                        );
                    }
                    Deferral::RetryNow => {
                        self.queue.push(Task::Parse {
                            package: package_label,
                            dependor: undefer_label(),
                            subinclude: true,
                        });
                    }
                }
            }
            Err(e) => self.parse_failed(tid, &package_label, e),
        }
    }

    pub(crate) fn parse_failed(&self, tid: i32, package_label: &BuildLabel, err: BuildError) {
        warn!("parse of {} failed: {}", package_label, err);
        self.state.publish(
            gantrycore::BuildResult::new(
                tid,
                package_label.clone(),
                Status::ParseFailed,
                "Parse failed",
            )
            .with_error(&err),
        );
        // Everything waiting on this package fails with it.
        let pending = self
            .defers
            .take_pending(&package_label.subrepo, &package_label.package);
        for pa in &pending {
            debug!(
                "{}:{} fails: package did not parse",
                package_label.package, pa.name
            );
        }
        self.hard_failures.lock().unwrap().push(err);
        if !self.state.options.keep_going {
            self.stop_all();
        } else {
            self.maybe_finish();
        }
    }

    /// Re-activate everything that was waiting on a freshly parsed package.
    fn drain_pending(&self, tid: i32, package_label: &BuildLabel) {
        let pending = self
            .defers
            .take_pending(&package_label.subrepo, &package_label.package);
        for pa in pending {
            let label = BuildLabel::with_subrepo(
                package_label.subrepo.clone(),
                package_label.package.clone(),
                pa.name,
            );
            self.activate_target(tid, &label, &pa.dependor, pa.mode, pa.subinclude);
        }
        self.maybe_finish();
    }

    // ------ completion and failure ------

    /// Called by the build step once a target reaches `Built` (or was
    /// reused/cached): wakes deferred parses, rescans reverse deps, and
    /// checks for termination.
    pub(crate) fn on_built(&self, _tid: i32, target: &Target) {
        for pkg_label in self.defers.on_subinclude_built(&target.label) {
            self.queue.push(Task::Parse {
                package: pkg_label,
                dependor: undefer_label(),
                subinclude: true,
            });
        }
        for rd_label in self.state.graph.rev_deps(&target.label) {
            if let Some(rd) = self.state.graph.target(&rd_label) {
                self.check_ready(&rd, false);
            }
        }
        self.maybe_finish();
    }

    /// Rescan a package after a post-build callback mutated it: newly
    /// added targets and edges may change readiness anywhere in the package.
    pub(crate) fn rescan_package(&self, tid: i32, package: &Package) {
        for target in package.all_targets() {
            if target.state() == TargetState::Active {
                for dep in self.state.graph.resolved_deps(&target) {
                    self.activate_inner(
                        tid,
                        dep,
                        target.label.clone(),
                        Mode::Normal,
                        self.is_subinclude_needed(&target.label),
                    );
                }
                self.check_ready(&target, false);
            }
        }
    }

    /// Drive a target to a terminal state from wherever it currently is.
    /// Returns the prior state the first time it lands, `None` if the
    /// target was already terminal.
    pub(crate) fn force_terminal(&self, target: &Target, terminal: TargetState) -> Option<TargetState> {
        loop {
            let current = target.state();
            if current.is_done() {
                return None;
            }
            if self.state.graph.cas_target(target, current, terminal) {
                return Some(current);
            }
        }
    }

    /// The completions this target still owes the done counter, given the
    /// state it failed from.
    pub(crate) fn remaining_cost(&self, target: &Target, prior: TargetState) -> u64 {
        if prior < TargetState::Active {
            return 0;
        }
        if self.will_test(target) { 2 } else { 1 }
    }

    /// Fail a target: record the cause, settle the counters, tell the bus,
    /// propagate to dependents, and (without `keep_going`) stop the build.
    pub(crate) fn fail_target(&self, tid: i32, target: &Target, cause: BuildError) {
        target.set_failure(cause.clone());
        if let Some(prior) = self.force_terminal(target, TargetState::Failed) {
            self.state.add_done(self.remaining_cost(target, prior));
        }
        self.state.publish(
            gantrycore::BuildResult::new(
                tid,
                target.label.clone(),
                Status::BuildFailed,
                "Failed",
            )
            .with_error(&cause),
        );

        // Parses deferred on this target can never proceed.
        for pkg_label in self.defers.on_subinclude_failed(&target.label) {
            self.parse_failed(
                tid,
                &pkg_label,
                BuildError::DependencyParseFailed {
                    package: pkg_label.package.clone(),
                    cause: BuildError::DependencyFailed(target.label.clone()).to_string(),
                },
            );
        }

        self.propagate_failure(tid, target);
        if !self.state.options.keep_going {
            self.stop_all();
        } else {
            self.maybe_finish();
        }
    }

    /// Mark every transitive dependent of a failed target.
    ///
    /// Without `keep_going` they become `Failed` with a
    /// `DependencyFailed` cause. With it, dependents that were never
    /// counted stay `Inactive`/`Semiactive` and are simply never scheduled;
    /// counted ones become `Stopped` so the done counter still converges.
    fn propagate_failure(&self, tid: i32, origin: &Target) {
        let keep_going = self.state.options.keep_going;
        let graph = &self.state.graph;
        let mut stack = vec![origin.label.clone()];
        let mut seen: HashSet<BuildLabel> = HashSet::new();
        while let Some(label) = stack.pop() {
            for rd_label in graph.rev_deps(&label) {
                if !seen.insert(rd_label.clone()) {
                    continue;
                }
                stack.push(rd_label.clone());
                let Some(rd) = graph.target(&rd_label) else {
                    continue;
                };
                if rd.is_done() {
                    continue;
                }
                let cause = BuildError::DependencyFailed(origin.label.clone());
                if keep_going {
                    if rd.state() >= TargetState::Active {
                        rd.set_failure(cause.clone());
                        if let Some(prior) = self.force_terminal(&rd, TargetState::Stopped) {
                            self.state.add_done(self.remaining_cost(&rd, prior));
                        }
                        self.state.publish(
                            gantrycore::BuildResult::new(
                                tid,
                                rd_label,
                                Status::Stopped,
                                "Dependency failed",
                            )
                            .with_error(&cause),
                        );
                    }
                } else {
                    rd.set_failure(cause.clone());
                    if let Some(prior) = self.force_terminal(&rd, TargetState::Failed) {
                        self.state.add_done(self.remaining_cost(&rd, prior));
                    }
                    self.state.publish(
                        gantrycore::BuildResult::new(
                            tid,
                            rd_label,
                            Status::BuildFailed,
                            "Dependency failed",
                        )
                        .with_error(&cause),
                    );
                }
            }
        }
    }

    /// Record a failure that has no graph target to hang off.
    pub(crate) fn record_failure(&self, tid: i32, label: BuildLabel, err: BuildError) {
        warn!("{}", err);
        self.state.publish(
            gantrycore::BuildResult::new(tid, label, Status::BuildFailed, "Failed")
                .with_error(&err),
        );
        self.hard_failures.lock().unwrap().push(err);
        if !self.state.options.keep_going {
            self.stop_all();
        } else {
            self.maybe_finish();
        }
    }

    pub fn hard_failures(&self) -> Vec<BuildError> {
        self.hard_failures.lock().unwrap().clone()
    }

    // ------ lifecycle ------

    pub(crate) fn begin_task(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn finish_task(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.maybe_finish();
    }

    /// Close the queues once everything that was counted has completed and
    /// nothing is queued or in flight. Workers then receive `Stop`.
    pub(crate) fn maybe_finish(&self) {
        if self.queue.is_closed() {
            return;
        }
        if self.state.is_finished()
            && self.queue.is_empty()
            && self.in_flight.load(Ordering::Acquire) == 0
        {
            debug!(
                "build finished: {}/{} done",
                self.state.num_done(),
                self.state.num_active()
            );
            self.queue.close();
        }
    }

    /// Stop everything: drains and closes the queues; in-flight executions
    /// are cancelled best-effort by their own deadline handling.
    pub fn stop_all(&self) {
        self.state.stop();
        self.queue.close();
    }
}
