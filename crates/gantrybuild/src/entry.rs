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

//! Top-level build driving: activate the requested labels, run the worker
//! pools to completion, settle the counters and aggregate the outcome.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use anyhow::Context;
use gantrycore::bus::Status;
use gantrycore::coverage::{CoverageSummary, TestCoverage};
use gantrycore::error::BuildError;
use gantrycore::results::TestSuite;
use gantrycore::target::TargetState;
use gantryutil::label::BuildLabel;
use log::debug;

use crate::schedule::{Mode, Scheduler};
use crate::worker::WorkerPools;

/// What one invocation did, aggregated after the queues closed.
#[derive(Debug, Default)]
pub struct BuildSummary {
    pub built: usize,
    pub cached: usize,
    pub failed: usize,
    pub stopped: usize,
    pub suites: Vec<TestSuite>,
    pub coverage: Option<CoverageSummary>,
    pub hard_failures: Vec<BuildError>,
}

impl BuildSummary {
    pub fn tests_failed(&self) -> bool {
        self.suites.iter().any(|s| !s.all_succeeded())
    }

    pub fn tests_passed(&self) -> usize {
        self.suites.iter().map(|s| s.passes()).sum()
    }

    pub fn tests_run(&self) -> usize {
        self.suites.iter().map(|s| s.tests()).sum()
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.hard_failures.is_empty() && !self.tests_failed()
    }

    /// `0` success, `1` general failure, `7` failing tests (unless they
    /// were waved through).
    pub fn exit_code(&self, failing_tests_ok: bool) -> i32 {
        if self.failed > 0 || self.stopped > 0 || !self.hard_failures.is_empty() {
            1
        } else if self.tests_failed() && !failing_tests_ok {
            7
        } else {
            0
        }
    }
}

/// Drive a full build of the given labels to completion.
///
/// `subprocess_count` is shared with the resource sampler so the follow
/// stream can report how many worker processes are running.
pub fn run_build(
    scheduler: &Arc<Scheduler>,
    labels: Vec<BuildLabel>,
    mode: Mode,
    subprocess_count: Arc<AtomicUsize>,
) -> anyhow::Result<BuildSummary> {
    let state = &scheduler.state;
    for label in labels {
        state.add_original_target(label.clone());
        scheduler.activate(0, label, BuildLabel::original_target(), mode);
    }
    // Nothing may have been activated at all (empty package, filters).
    scheduler.maybe_finish();

    let pools = WorkerPools::start(Arc::clone(scheduler), subprocess_count);
    pools.join();

    let summary = finalize(scheduler);
    write_logs(scheduler, &summary)?;
    Ok(summary)
}

/// Settle every counted-but-unfinished target (a stopped build leaves
/// them behind) and aggregate results from the graph.
fn finalize(scheduler: &Scheduler) -> BuildSummary {
    let state = &scheduler.state;
    let mut summary = BuildSummary {
        hard_failures: scheduler.hard_failures(),
        ..Default::default()
    };
    let mut coverage = TestCoverage::default();

    for package in state.graph.packages() {
        for target in package.all_targets() {
            let tested = scheduler.will_test(&target);
            match target.state() {
                TargetState::Built => {
                    summary.built += 1;
                    match target.results() {
                        Some(suite) => {
                            if suite.cached {
                                summary.cached += 1;
                            }
                            summary.suites.push(suite);
                        }
                        None if tested => {
                            // Built but never tested: the build stopped
                            // before its test task ran.
                            summary.stopped += 1;
                            state.add_done(1);
                            state.publish_status(
                                0,
                                target.label.clone(),
                                Status::Stopped,
                                "Stopped before testing",
                            );
                        }
                        None => {}
                    }
                    if let Some(c) = target.coverage() {
                        coverage.merge(&c);
                    }
                }
                TargetState::Failed => summary.failed += 1,
                TargetState::Stopped => summary.stopped += 1,
                state_now if state_now >= TargetState::Active => {
                    // Counted but never reached a terminal state.
                    summary.stopped += 1;
                    if let Some(prior) = scheduler.force_terminal(&target, TargetState::Stopped)
                    {
                        state.add_done(scheduler.remaining_cost(&target, prior));
                        state.publish_status(
                            0,
                            target.label.clone(),
                            Status::Stopped,
                            "Stopped",
                        );
                    }
                }
                _ => {}
            }
        }
    }

    // Parses still blocked on a subinclude can never have made progress;
    // surface them instead of silently dropping the packages.
    for (subinclude, packages) in scheduler.defers.deferred_packages() {
        for package in packages {
            summary.hard_failures.push(BuildError::ParseFailed {
                package: package.package.clone(),
                reason: format!("still waiting on subinclude {subinclude}"),
            });
        }
    }

    if state.options.need_coverage && !coverage.is_empty() {
        summary.coverage = Some(CoverageSummary::from_coverage(&coverage));
    }
    debug!(
        "finalized: {} built, {} failed, {} stopped, {}/{} done",
        summary.built,
        summary.failed,
        summary.stopped,
        state.num_done(),
        state.num_active()
    );
    summary
}

/// Persist the invocation-wide aggregates under `plz-out/log/`.
fn write_logs(scheduler: &Scheduler, summary: &BuildSummary) -> anyhow::Result<()> {
    let state = &scheduler.state;
    let log_dir = state.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create {}", log_dir.display()))?;

    if !summary.suites.is_empty() {
        let path = log_dir.join("test_results.json");
        std::fs::write(&path, serde_json::to_string_pretty(&summary.suites)?)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }
    if let Some(coverage) = &summary.coverage {
        let path = log_dir.join("coverage.json");
        std::fs::write(&path, serde_json::to_string_pretty(coverage)?)
            .with_context(|| format!("cannot write {}", path.display()))?;
    }
    Ok(())
}
