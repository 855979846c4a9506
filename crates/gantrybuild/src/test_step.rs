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

//! Running one target's tests: cached suites, the flake retry loop, and
//! the exit/results synthesis matrix.

use std::sync::Arc;
use std::time::Instant;

use gantrycore::bus::Status;
use gantrycore::coverage::TestCoverage;
use gantrycore::error::BuildError;
use gantrycore::execute::ExecOutput;
use gantrycore::results::{FailureKind, TestCase, TestExecution, TestOutcome, TestSuite};
use gantrycore::target::{Target, TargetState};
use gantryutil::fsattr;
use log::{debug, warn};

use crate::schedule::Scheduler;
use crate::worker::PoolKind;

impl Scheduler {
    pub(crate) fn handle_test(&self, tid: i32, pool: PoolKind, target: &Arc<Target>) {
        if target.state() != TargetState::Built {
            // The build never completed; the failure path settled the
            // counters already.
            return;
        }
        self.state
            .publish_status(tid, target.label.clone(), Status::Testing, "Testing...");

        let hash = target.runtime_hash().unwrap_or_default();
        if let Some((suite, coverage)) = self.load_cached_results(target, &hash) {
            debug!("{} test results are cached", target.label);
            target.set_results(suite.clone());
            if let Some(coverage) = coverage {
                target.set_coverage(coverage);
            }
            self.state.publish(
                gantrycore::BuildResult::new(
                    tid,
                    target.label.clone(),
                    Status::Tested,
                    "Cached test results",
                )
                .with_tests(suite),
            );
            self.state.add_done(1);
            return;
        }

        let runs = self.state.options.num_test_runs.max(1);
        let attempts = target.flakiness.max(1);
        let mut outer = TestSuite::new(
            target.label.package.clone(),
            target.label.name.clone(),
        );
        let mut coverage = TestCoverage::default();

        'runs: for run in 1..=runs {
            for attempt in 1..=attempts {
                if self.state.is_stopping() {
                    break 'runs;
                }
                debug!(
                    "{}: run {}/{} attempt {}/{}",
                    target.label, run, runs, attempt, attempts
                );
                let attempt_suite = self.run_test_once(pool, target, run, &mut coverage);
                let succeeded = attempt_suite.all_succeeded();
                outer.collapse(attempt_suite);
                if succeeded {
                    break;
                }
            }
        }

        if self.state.is_stopping() && outer.cases.is_empty() {
            // Never ran; the finalizer settles this target as Stopped.
            return;
        }

        let succeeded = outer.all_succeeded();
        target.set_results(outer.clone());
        if self.state.options.need_coverage {
            target.set_coverage(coverage.clone());
        }

        if succeeded {
            self.store_cached_results(target, &hash, &outer, &coverage);
            let flakes = outer.flakes();
            let description = if flakes > 0 {
                format!("Passed ({flakes} flaky)")
            } else {
                "Passed".to_owned()
            };
            self.state.publish(
                gantrycore::BuildResult::new(
                    tid,
                    target.label.clone(),
                    Status::Tested,
                    description,
                )
                .with_tests(outer)
                .with_labels(target.labels.clone()),
            );
        } else {
            let err = BuildError::TestFailed {
                label: target.label.clone(),
                reason: format!(
                    "{} failed, {} errored of {} tests",
                    outer.failures(),
                    outer.errors(),
                    outer.tests()
                ),
            };
            self.state.publish(
                gantrycore::BuildResult::new(
                    tid,
                    target.label.clone(),
                    Status::TestFailed,
                    "Tests failed",
                )
                .with_tests(outer)
                .with_error(&err),
            );
        }
        self.state.add_done(1);
    }

    /// One execution of the test command in a fresh directory, synthesized
    /// into a suite per the exit/results matrix.
    fn run_test_once(
        &self,
        pool: PoolKind,
        target: &Arc<Target>,
        run: u32,
        coverage: &mut TestCoverage,
    ) -> TestSuite {
        let mut suite = TestSuite::new(
            target.label.package.clone(),
            target.label.name.clone(),
        );
        let started = Instant::now();

        if let Err(e) = self.prepare_test_dir(target) {
            suite.add_case(synthetic_case(
                &target.label.name,
                SyntheticKind::Error(FailureKind::NoResults),
                e.to_string(),
                None,
            ));
            return suite;
        }

        let result = match pool {
            PoolKind::Local => self.executor.test(&self.state, target, run),
            PoolKind::Remote => self.executor.test_remotely(&self.state, target, run),
        };
        suite.duration = started.elapsed();

        match result {
            Err(e) => {
                let kind = match e {
                    BuildError::Timeout(_) => FailureKind::Other("Timeout".to_owned()),
                    _ => FailureKind::Other("ExecutionError".to_owned()),
                };
                suite.add_case(synthetic_case(
                    &target.label.name,
                    SyntheticKind::Error(kind),
                    e.to_string(),
                    None,
                ));
            }
            Ok(out) => self.interpret_test_output(target, &out, &mut suite),
        }

        if self.state.options.need_coverage {
            let coverage_file = self.state.tmp_test_dir(target).join("test.coverage");
            if coverage_file.is_file() {
                match self.reader.read_coverage(target, &coverage_file) {
                    Ok(c) => coverage.merge(&c),
                    Err(e) => warn!("cannot read coverage of {}: {}", target.label, e),
                }
            }
        }
        if !self.state.options.keep_workdirs {
            let _ = std::fs::remove_dir_all(self.state.tmp_test_dir(target));
        }
        suite
    }

    /// The §exit/results matrix: what to report given the exit status, the
    /// presence and parseability of `test.results`, and `no_test_output`.
    fn interpret_test_output(&self, target: &Target, out: &ExecOutput, suite: &mut TestSuite) {
        let name = &target.label.name;
        let results_file = self.state.tmp_test_dir(target).join("test.results");
        let stdout = (!out.stdout.is_empty()).then(|| out.stdout.clone());

        if !results_file.is_file() {
            let case = match (out.success(), target.no_test_output) {
                (true, true) => {
                    let mut case = TestCase::new(name.clone());
                    case.executions.push(TestExecution::success(None));
                    case
                }
                (true, false) => synthetic_case(
                    name,
                    SyntheticKind::Error(FailureKind::MissingResults),
                    "test ran but produced no results file".to_owned(),
                    stdout,
                ),
                (false, true) => synthetic_case(
                    name,
                    SyntheticKind::Failure(FailureKind::TestFailed),
                    format!("test failed with exit code {:?}", out.code),
                    stdout,
                ),
                (false, false) => synthetic_case(
                    name,
                    SyntheticKind::Error(FailureKind::NoResults),
                    format!("test failed with exit code {:?} and no results", out.code),
                    stdout,
                ),
            };
            suite.add_case(case);
            return;
        }

        match self.reader.read_results(target, &results_file) {
            Err(parse_err) => {
                // Unparseable results are NoResults whatever the exit code;
                // the parse trace rides along for exit 0.
                suite.add_case(synthetic_case(
                    name,
                    SyntheticKind::Error(FailureKind::NoResults),
                    if out.success() {
                        format!("unparseable test results: {parse_err}")
                    } else {
                        "unparseable test results".to_owned()
                    },
                    stdout,
                ));
            }
            Ok(parsed) => {
                let had_failures = parsed.failures() > 0 || parsed.errors() > 0;
                suite.collapse(parsed);
                if !out.success() && !had_failures {
                    suite.add_case(synthetic_case(
                        "Return value",
                        SyntheticKind::Error(FailureKind::ReturnValue),
                        format!(
                            "test results report success but exit code was {:?}",
                            out.code
                        ),
                        stdout,
                    ));
                } else if out.success() && parsed_failure_count_nonzero(suite) {
                    // Covered by the parsed failures themselves; the extra
                    // case records the disagreement with the exit code.
                    suite.add_case(synthetic_case(
                        "Return value",
                        SyntheticKind::Failure(FailureKind::ReturnValue),
                        "test results report failures but exit code was 0".to_owned(),
                        None,
                    ));
                }
            }
        }
    }

    fn prepare_test_dir(&self, target: &Target) -> Result<(), BuildError> {
        let test_dir = self.state.tmp_test_dir(target);
        let io = |e: std::io::Error| BuildError::TestError {
            label: target.label.clone(),
            reason: format!("cannot prepare test dir: {e}"),
        };
        let _ = std::fs::remove_dir_all(&test_dir);
        std::fs::create_dir_all(&test_dir).map_err(io)?;
        // The target's runtime files are its own outputs.
        for out in &target.outs {
            let from = self.state.target_out_path(target, out);
            if !from.exists() {
                continue;
            }
            let to = test_dir.join(out);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(io)?;
            }
            std::fs::copy(&from, &to).map_err(io)?;
        }
        Ok(())
    }

    /// A cached suite is honored only when its recorded hash matches the
    /// target's runtime hash, it parses, and (when coverage is requested)
    /// the coverage side is equally valid.
    fn load_cached_results(
        &self,
        target: &Target,
        hash: &str,
    ) -> Option<(TestSuite, Option<TestCoverage>)> {
        if hash.is_empty() {
            return None;
        }
        let path = self.state.cached_results_path(target);
        if !path.is_file() {
            return None;
        }
        if fsattr::read_artifact_hash(&path).as_deref() != Some(hash) {
            self.discard_corrupt_cache(target);
            return None;
        }
        let mut suite: TestSuite = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
        {
            Some(suite) => suite,
            None => {
                self.discard_corrupt_cache(target);
                return None;
            }
        };
        if !suite.all_succeeded() {
            // Failing suites are never cached; one on disk is corrupt.
            self.discard_corrupt_cache(target);
            return None;
        }
        suite.cached = true;

        if !self.state.options.need_coverage {
            return Some((suite, None));
        }
        let coverage_path = self.state.cached_coverage_path(target);
        if !coverage_path.is_file()
            || fsattr::read_artifact_hash(&coverage_path).as_deref() != Some(hash)
        {
            return None;
        }
        match std::fs::read_to_string(&coverage_path)
            .ok()
            .and_then(|s| serde_json::from_str::<TestCoverage>(&s).ok())
        {
            Some(coverage) => Some((suite, Some(coverage))),
            None => {
                self.discard_corrupt_cache(target);
                None
            }
        }
    }

    fn discard_corrupt_cache(&self, target: &Target) {
        warn!("{}", BuildError::CacheCorrupt(target.label.clone()));
        let _ = std::fs::remove_file(self.state.cached_results_path(target));
        let _ = std::fs::remove_file(self.state.cached_coverage_path(target));
    }

    fn store_cached_results(
        &self,
        target: &Target,
        hash: &str,
        suite: &TestSuite,
        coverage: &TestCoverage,
    ) {
        if hash.is_empty() || !suite.all_succeeded() {
            return;
        }
        let path = self.state.cached_results_path(target);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let write = std::fs::write(
            &path,
            serde_json::to_string(suite).expect("suites serialize"),
        )
        .and_then(|_| fsattr::write_artifact_hash(&path, hash));
        if let Err(e) = write {
            warn!("cannot cache test results of {}: {}", target.label, e);
            return;
        }
        if self.state.options.need_coverage && !coverage.is_empty() {
            let coverage_path = self.state.cached_coverage_path(target);
            let write = std::fs::write(
                &coverage_path,
                serde_json::to_string(coverage).expect("coverage serializes"),
            )
            .and_then(|_| fsattr::write_artifact_hash(&coverage_path, hash));
            if let Err(e) = write {
                warn!("cannot cache coverage of {}: {}", target.label, e);
            }
        }
    }
}

enum SyntheticKind {
    Failure(FailureKind),
    Error(FailureKind),
}

fn synthetic_case(
    name: &str,
    kind: SyntheticKind,
    message: String,
    stdout: Option<String>,
) -> TestCase {
    let outcome = match kind {
        SyntheticKind::Failure(kind) => TestOutcome::Failure {
            kind,
            message,
            traceback: None,
        },
        SyntheticKind::Error(kind) => TestOutcome::Error {
            kind,
            message,
            traceback: None,
        },
    };
    let mut case = TestCase::new(name);
    case.executions.push(TestExecution {
        outcome,
        stdout,
        stderr: None,
    });
    case
}

fn parsed_failure_count_nonzero(suite: &TestSuite) -> bool {
    suite.failures() > 0 || suite.errors() > 0
}
