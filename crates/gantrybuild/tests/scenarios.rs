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

//! End-to-end scheduler scenarios driven through mock collaborators.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantrybuild::entry::{BuildSummary, run_build};
use gantrybuild::schedule::{Mode, Scheduler};
use gantrycore::bus::Status;
use gantrycore::coverage::TestCoverage;
use gantrycore::error::BuildError;
use gantrycore::execute::{ExecOutput, Executor};
use gantrycore::package::Package;
use gantrycore::parse::{ParseOutcome, Parser};
use gantrycore::results::{
    FailureKind, ResultReader, TestCase, TestExecution, TestOutcome, TestSuite,
};
use gantrycore::state::{BuildOptions, BuildState};
use gantrycore::target::{Target, TargetState};
use gantryutil::label::BuildLabel;

// ---- mock collaborators ----

#[derive(Clone, Default)]
struct TargetSpec {
    name: &'static str,
    deps: Vec<&'static str>,
    labels: Vec<&'static str>,
    is_test: bool,
    flakiness: u32,
}

impl TargetSpec {
    fn new(name: &'static str) -> Self {
        TargetSpec {
            name,
            ..Default::default()
        }
    }

    fn dep(mut self, dep: &'static str) -> Self {
        self.deps.push(dep);
        self
    }

    fn label(mut self, label: &'static str) -> Self {
        self.labels.push(label);
        self
    }

    fn test(mut self, flakiness: u32) -> Self {
        self.is_test = true;
        self.flakiness = flakiness;
        self
    }
}

#[derive(Clone, Default)]
struct PackageSpec {
    subinclude: Vec<&'static str>,
    targets: Vec<TargetSpec>,
}

/// A parser over programmatic package declarations, counting every
/// invocation so the at-most-once property is checkable.
#[derive(Default)]
struct MockParser {
    packages: HashMap<&'static str, PackageSpec>,
    parse_counts: Mutex<HashMap<String, usize>>,
}

impl MockParser {
    fn package(mut self, path: &'static str, spec: PackageSpec) -> Self {
        self.packages.insert(path, spec);
        self
    }

    fn parse_count(&self, path: &str) -> usize {
        *self.parse_counts.lock().unwrap().get(path).unwrap_or(&0)
    }
}

impl Parser for MockParser {
    fn parse_file(
        &self,
        state: &BuildState,
        package: &Arc<Package>,
        _filename: &Path,
    ) -> Result<ParseOutcome, BuildError> {
        *self
            .parse_counts
            .lock()
            .unwrap()
            .entry(package.path.clone())
            .or_insert(0) += 1;
        let spec = self
            .packages
            .get(package.path.as_str())
            .ok_or_else(|| BuildError::ParseFailed {
                package: package.path.clone(),
                reason: "unknown package".to_owned(),
            })?;
        for sub in &spec.subinclude {
            let label: BuildLabel = sub.parse().unwrap();
            let built = state
                .graph
                .target(&label)
                .is_some_and(|t| t.state() == TargetState::Built);
            if !built {
                return Ok(ParseOutcome::Deferred(label));
            }
        }
        for t in &spec.targets {
            let label = BuildLabel::new(package.path.clone(), t.name);
            let mut target = Target::new(label);
            target.is_test = t.is_test;
            target.flakiness = t.flakiness;
            target.labels = t.labels.iter().map(|l| (*l).to_owned()).collect();
            state.graph.add_target(package, target)?;
        }
        for t in &spec.targets {
            let from = BuildLabel::new(package.path.clone(), t.name);
            for dep in &t.deps {
                state.graph.add_dependency(&from, dep.parse().unwrap())?;
            }
        }
        Ok(ParseOutcome::Done)
    }

    fn parse_reader(
        &self,
        _state: &BuildState,
        _package: &Arc<Package>,
        _reader: &mut dyn Read,
    ) -> Result<(), BuildError> {
        unimplemented!("not used by these scenarios")
    }

    fn run_pre_build(&self, _state: &BuildState, _target: &Arc<Target>) -> Result<(), BuildError> {
        Ok(())
    }

    fn run_post_build(
        &self,
        _state: &BuildState,
        _target: &Arc<Target>,
        _stdout: &str,
    ) -> Result<(), BuildError> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum TestScript {
    Pass,
    Fail,
    /// Panic inside the executor, as a crashing worker would.
    Panic,
}

/// An executor that records build order and concurrency, fails on demand,
/// and writes scripted `test.results` files.
#[derive(Default)]
struct MockExecutor {
    failing: Vec<&'static str>,
    /// label -> outcome per attempt (the last entry repeats).
    test_scripts: HashMap<&'static str, Vec<TestScript>>,
    build_order: Mutex<Vec<String>>,
    test_attempts: Mutex<HashMap<String, usize>>,
    /// limit label -> (current, max observed) concurrent builds.
    running: Mutex<HashMap<String, (usize, usize)>>,
    build_delay: Option<Duration>,
}

impl MockExecutor {
    fn failing(mut self, label: &'static str) -> Self {
        self.failing.push(label);
        self
    }

    fn script(mut self, label: &'static str, outcomes: Vec<TestScript>) -> Self {
        self.test_scripts.insert(label, outcomes);
        self
    }

    fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    fn build_order(&self) -> Vec<String> {
        self.build_order.lock().unwrap().clone()
    }

    fn max_concurrent(&self, label: &str) -> usize {
        self.running.lock().unwrap().get(label).map_or(0, |e| e.1)
    }
}

impl Executor for MockExecutor {
    fn build(&self, _state: &BuildState, target: &Arc<Target>) -> Result<ExecOutput, BuildError> {
        self.build_order
            .lock()
            .unwrap()
            .push(target.label.to_string());
        {
            let mut running = self.running.lock().unwrap();
            for label in &target.labels {
                let entry = running.entry(label.clone()).or_insert((0, 0));
                entry.0 += 1;
                entry.1 = entry.1.max(entry.0);
            }
        }
        if let Some(delay) = self.build_delay {
            std::thread::sleep(delay);
        }
        {
            let mut running = self.running.lock().unwrap();
            for label in &target.labels {
                running.get_mut(label).unwrap().0 -= 1;
            }
        }
        let key = target.label.to_string();
        if self.failing.iter().any(|f| *f == key) {
            return Err(BuildError::BuildFailed {
                label: target.label.clone(),
                reason: "scripted failure".to_owned(),
            });
        }
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            code: Some(0),
        })
    }

    fn test(
        &self,
        state: &BuildState,
        target: &Arc<Target>,
        _run: u32,
    ) -> Result<ExecOutput, BuildError> {
        let key = target.label.to_string();
        let attempt = {
            let mut attempts = self.test_attempts.lock().unwrap();
            let n = attempts.entry(key.clone()).or_insert(0);
            *n += 1;
            *n - 1
        };
        let outcome = self
            .test_scripts
            .get(key.as_str())
            .and_then(|s| s.get(attempt).or_else(|| s.last()))
            .copied()
            .unwrap_or(TestScript::Pass);
        let dir = state.tmp_test_dir(target);
        let line = match outcome {
            TestScript::Pass => {
                r#"{"name": "case", "status": "pass", "duration_ms": 1}"#
            }
            TestScript::Fail => {
                r#"{"name": "case", "status": "fail", "message": "scripted"}"#
            }
            TestScript::Panic => panic!("scripted test panic"),
        };
        std::fs::write(dir.join("test.results"), format!("{line}\n")).unwrap();
        let code = match outcome {
            TestScript::Pass => Some(0),
            TestScript::Fail | TestScript::Panic => Some(1),
        };
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            code,
        })
    }
}

/// Reads the single-line results the mock executor writes.
#[derive(Default)]
struct MockReader {}

impl ResultReader for MockReader {
    fn read_results(&self, target: &Target, results_file: &Path) -> Result<TestSuite, BuildError> {
        let content =
            std::fs::read_to_string(results_file).map_err(|e| BuildError::TestError {
                label: target.label.clone(),
                reason: e.to_string(),
            })?;
        let mut suite = TestSuite::new(target.label.package.clone(), target.label.name.clone());
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: serde_json::Value =
                serde_json::from_str(line).map_err(|e| BuildError::TestError {
                    label: target.label.clone(),
                    reason: e.to_string(),
                })?;
            let name = parsed["name"].as_str().unwrap_or("case").to_owned();
            let outcome = match parsed["status"].as_str() {
                Some("pass") => TestOutcome::Success { duration: None },
                _ => TestOutcome::Failure {
                    kind: FailureKind::TestFailed,
                    message: parsed["message"].as_str().unwrap_or("").to_owned(),
                    traceback: None,
                },
            };
            let mut case = TestCase::new(name);
            case.executions.push(TestExecution {
                outcome,
                stdout: None,
                stderr: None,
            });
            suite.add_case(case);
        }
        if suite.cases.is_empty() {
            return Err(BuildError::TestError {
                label: target.label.clone(),
                reason: "empty results".to_owned(),
            });
        }
        Ok(suite)
    }

    fn read_coverage(
        &self,
        _target: &Target,
        _coverage_file: &Path,
    ) -> Result<TestCoverage, BuildError> {
        Ok(TestCoverage::default())
    }
}

// ---- harness ----

struct Fixture {
    scheduler: Arc<Scheduler>,
    parser: Arc<MockParser>,
    executor: Arc<MockExecutor>,
    _root: tempfile::TempDir,
}

impl Fixture {
    fn new(parser: MockParser, executor: MockExecutor, tweak: impl FnOnce(&mut BuildOptions)) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        // Packages exist on disk so build-file discovery succeeds; their
        // content is irrelevant to the mock parser.
        for path in parser.packages.keys() {
            let dir = root.path().join(path);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("BUILD.json"), "{}").unwrap();
        }
        let mut options = BuildOptions {
            root: root.path().to_path_buf(),
            num_threads: 4,
            ..Default::default()
        };
        tweak(&mut options);
        let state = Arc::new(BuildState::new(options));
        let parser = Arc::new(parser);
        let executor = Arc::new(executor);
        let scheduler = Scheduler::new(
            Arc::clone(&state),
            Arc::clone(&parser) as Arc<dyn Parser>,
            Arc::clone(&executor) as Arc<dyn Executor>,
            Arc::new(MockReader::default()),
            None,
        );
        Fixture {
            scheduler,
            parser,
            executor,
            _root: root,
        }
    }

    fn run(&self, labels: &[&str]) -> BuildSummary {
        let labels = labels.iter().map(|l| l.parse().unwrap()).collect();
        run_build(
            &self.scheduler,
            labels,
            Mode::Normal,
            Arc::new(AtomicUsize::new(0)),
        )
        .unwrap()
    }

    fn state_of(&self, label: &str) -> TargetState {
        self.scheduler
            .state
            .graph
            .target(&label.parse().unwrap())
            .map(|t| t.state())
            .unwrap_or(TargetState::Inactive)
    }
}

// ---- scenarios ----

#[test]
fn single_build_chain() {
    let fixture = Fixture::new(
        MockParser::default()
            .package(
                "a",
                PackageSpec {
                    targets: vec![TargetSpec::new("x").dep("//b:y")],
                    ..Default::default()
                },
            )
            .package(
                "b",
                PackageSpec {
                    targets: vec![TargetSpec::new("y")],
                    ..Default::default()
                },
            ),
        MockExecutor::default(),
        |_| {},
    );
    let summary = fixture.run(&["//a:x"]);

    assert_eq!(summary.built, 2);
    assert_eq!(summary.exit_code(false), 0);
    assert_eq!(fixture.state_of("//a:x"), TargetState::Built);
    assert_eq!(fixture.state_of("//b:y"), TargetState::Built);
    // The dependency built strictly before its dependor.
    assert_eq!(fixture.executor.build_order(), vec!["//b:y", "//a:x"]);
    // At-most-once parse, even with two labels in flight.
    assert_eq!(fixture.parser.parse_count("a"), 1);
    assert_eq!(fixture.parser.parse_count("b"), 1);
    // Counter conservation.
    let state = &fixture.scheduler.state;
    assert_eq!(state.num_done(), state.num_active());
    assert_eq!(state.num_active(), 2);
}

#[test]
fn missing_label_suggests_neighbors() {
    let fixture = Fixture::new(
        MockParser::default().package(
            "a",
            PackageSpec {
                targets: vec![TargetSpec::new("x"), TargetSpec::new("y")],
                ..Default::default()
            },
        ),
        MockExecutor::default(),
        |_| {},
    );
    let summary = fixture.run(&["//a:z"]);

    assert_eq!(summary.exit_code(false), 1);
    let [err] = summary.hard_failures.as_slice() else {
        panic!("expected exactly one failure, got {:?}", summary.hard_failures);
    };
    match err {
        BuildError::MissingTarget { suggestion, .. } => {
            let suggestion = suggestion.as_deref().expect("a suggestion");
            assert!(suggestion.starts_with("Maybe you meant :x"), "{suggestion}");
        }
        other => panic!("expected MissingTarget, got {other:?}"),
    }
}

#[test]
fn deferred_parse_retries_after_subinclude_builds() {
    let fixture = Fixture::new(
        MockParser::default()
            .package(
                "p",
                PackageSpec {
                    subinclude: vec!["//tools:gen"],
                    targets: vec![TargetSpec::new("lib"), TargetSpec::new("bin").dep(":lib")],
                },
            )
            .package(
                "tools",
                PackageSpec {
                    targets: vec![TargetSpec::new("gen")],
                    ..Default::default()
                },
            ),
        MockExecutor::default(),
        |_| {},
    );
    let summary = fixture.run(&["//p:all"]);

    assert_eq!(summary.exit_code(false), 0);
    assert_eq!(fixture.state_of("//tools:gen"), TargetState::Built);
    assert_eq!(fixture.state_of("//p:lib"), TargetState::Built);
    assert_eq!(fixture.state_of("//p:bin"), TargetState::Built);
    // One aborted (deferred) parse, one successful retry.
    assert_eq!(fixture.parser.parse_count("p"), 2);
    // The subinclude built before anything in p.
    assert_eq!(fixture.executor.build_order()[0], "//tools:gen");
}

#[test]
fn flaky_test_passes_on_third_attempt() {
    let fixture = Fixture::new(
        MockParser::default().package(
            "t",
            PackageSpec {
                targets: vec![TargetSpec::new("flaky").test(3)],
                ..Default::default()
            },
        ),
        MockExecutor::default().script(
            "//t:flaky",
            vec![TestScript::Fail, TestScript::Fail, TestScript::Pass],
        ),
        |options| options.need_tests = true,
    );
    let summary = fixture.run(&["//t:flaky"]);

    assert_eq!(summary.exit_code(false), 0);
    assert_eq!(fixture.state_of("//t:flaky"), TargetState::Built);
    let [suite] = summary.suites.as_slice() else {
        panic!("expected one suite");
    };
    assert!(suite.all_succeeded());
    assert_eq!(suite.flakes(), 1);
    // Three executions collapsed onto the one case.
    assert_eq!(suite.cases.len(), 1);
    assert_eq!(suite.cases[0].executions.len(), 3);
    // The target was counted once as a build and once as a test, never
    // once per flake attempt.
    let state = &fixture.scheduler.state;
    assert_eq!(state.num_active(), 2);
    assert_eq!(state.num_done(), 2);
}

#[test]
fn exhausted_flakiness_reports_failure() {
    let fixture = Fixture::new(
        MockParser::default().package(
            "t",
            PackageSpec {
                targets: vec![TargetSpec::new("flaky").test(2)],
                ..Default::default()
            },
        ),
        MockExecutor::default().script("//t:flaky", vec![TestScript::Fail, TestScript::Fail]),
        |options| options.need_tests = true,
    );
    let summary = fixture.run(&["//t:flaky"]);

    assert_eq!(summary.exit_code(false), 7);
    assert_eq!(summary.exit_code(true), 0);
    let [suite] = summary.suites.as_slice() else {
        panic!("expected one suite");
    };
    assert!(!suite.all_succeeded());
    assert_eq!(suite.cases[0].executions.len(), 2);
}

#[test]
fn worker_panic_during_test_settles_once() {
    let fixture = Fixture::new(
        MockParser::default().package(
            "t",
            PackageSpec {
                targets: vec![TargetSpec::new("crashy").test(1)],
                ..Default::default()
            },
        ),
        MockExecutor::default().script("//t:crashy", vec![TestScript::Panic]),
        |options| options.need_tests = true,
    );
    let summary = fixture.run(&["//t:crashy"]);

    // The panic is recovered into a WorkerCrashed test result; the target
    // stays Built and the run ends as failing tests, not a hung build.
    assert_eq!(summary.exit_code(false), 7);
    assert_eq!(fixture.state_of("//t:crashy"), TargetState::Built);
    assert_eq!(summary.stopped, 0);
    let [suite] = summary.suites.as_slice() else {
        panic!("expected the crashed target's synthetic suite");
    };
    assert!(!suite.all_succeeded());
    assert_eq!(suite.errors(), 1);
    // The test completion was settled exactly once, not again by the
    // finalizer.
    let state = &fixture.scheduler.state;
    assert_eq!(state.num_active(), 2);
    assert_eq!(state.num_done(), 2);
}

#[test]
fn limiter_caps_concurrency_without_deadlock() {
    let fixture = Fixture::new(
        MockParser::default().package(
            "langs",
            PackageSpec {
                targets: vec![
                    TargetSpec::new("j1").label("java"),
                    TargetSpec::new("j2").label("java"),
                    TargetSpec::new("j3").label("java"),
                    TargetSpec::new("g1").label("go"),
                    TargetSpec::new("g2").label("go"),
                ],
                ..Default::default()
            },
        ),
        MockExecutor::default().with_build_delay(Duration::from_millis(60)),
        |options| {
            options.num_threads = 5;
            options.limits = vec![("java".to_owned(), 1), ("go".to_owned(), 2)];
        },
    );
    let summary = fixture.run(&["//langs:all"]);

    assert_eq!(summary.built, 5);
    assert_eq!(summary.exit_code(false), 0);
    assert_eq!(fixture.executor.max_concurrent("java"), 1);
    assert!(fixture.executor.max_concurrent("go") <= 2);
}

#[test]
fn failed_dependency_propagates() {
    let fixture = Fixture::new(
        MockParser::default()
            .package(
                "a",
                PackageSpec {
                    targets: vec![TargetSpec::new("x").dep("//b:bad")],
                    ..Default::default()
                },
            )
            .package(
                "b",
                PackageSpec {
                    targets: vec![TargetSpec::new("bad")],
                    ..Default::default()
                },
            ),
        MockExecutor::default().failing("//b:bad"),
        |_| {},
    );
    let summary = fixture.run(&["//a:x"]);

    assert_eq!(summary.exit_code(false), 1);
    assert_eq!(fixture.state_of("//b:bad"), TargetState::Failed);
    assert_eq!(fixture.state_of("//a:x"), TargetState::Failed);
    let x = fixture
        .scheduler
        .state
        .graph
        .target(&"//a:x".parse().unwrap())
        .unwrap();
    assert_eq!(
        x.failure(),
        Some(BuildError::DependencyFailed("//b:bad".parse().unwrap()))
    );
    let state = &fixture.scheduler.state;
    assert_eq!(state.num_done(), state.num_active());
}

#[test]
fn keep_going_still_builds_siblings() {
    let fixture = Fixture::new(
        MockParser::default().package(
            "a",
            PackageSpec {
                targets: vec![TargetSpec::new("bad"), TargetSpec::new("good")],
                ..Default::default()
            },
        ),
        MockExecutor::default().failing("//a:bad"),
        |options| options.keep_going = true,
    );
    let summary = fixture.run(&["//a:all"]);

    assert_eq!(summary.exit_code(false), 1);
    assert_eq!(summary.built, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(fixture.state_of("//a:good"), TargetState::Built);
    assert_eq!(fixture.state_of("//a:bad"), TargetState::Failed);
}

#[test]
fn all_expansion_respects_tag_filters() {
    let fixture = Fixture::new(
        MockParser::default().package(
            "a",
            PackageSpec {
                targets: vec![
                    TargetSpec::new("keep").label("go"),
                    TargetSpec::new("skip").label("java"),
                    TargetSpec::new("hand").label("manual"),
                ],
                ..Default::default()
            },
        ),
        MockExecutor::default(),
        |options| options.exclude = vec!["java".to_owned()],
    );
    let summary = fixture.run(&["//a:all"]);

    assert_eq!(summary.built, 1);
    assert_eq!(fixture.state_of("//a:keep"), TargetState::Built);
    assert_eq!(fixture.state_of("//a:skip"), TargetState::Inactive);
    assert_eq!(fixture.state_of("//a:hand"), TargetState::Inactive);
}

// ---- follower ----

#[test]
fn follower_bootstraps_from_snapshot_then_streams() {
    use gantrybuild::follow::client::{FollowOptions, FollowOutcome, follow};
    use gantrybuild::follow::server::FollowServer;
    use gantrycore::BuildResult;
    use gantryutil::stats::ResourceSampler;

    let primary = Arc::new(BuildState::new(BuildOptions::default()));
    let sampler = Arc::new(ResourceSampler::start());
    let server = FollowServer::start(Arc::clone(&primary), sampler, 0).unwrap();
    let base_url = format!("http://{}", server.addr);

    let event = |tid: i32, label: &str, status: Status| {
        BuildResult::new(tid, label.parse().unwrap(), status, "")
    };
    // Three events happen before the follower attaches; the primary's
    // counters advance as the build progresses.
    primary.add_active(2);
    primary.publish(event(0, "//a:x", Status::Building));
    primary.publish(event(1, "//b:y", Status::Building));
    primary.add_done(1);
    primary.publish(event(1, "//b:y", Status::Built));

    let local = Arc::new(BuildState::new(BuildOptions::default()));
    let received = local.bus.subscribe("collector");
    let follower = {
        let local = Arc::clone(&local);
        let base_url = base_url.clone();
        std::thread::spawn(move || follow(&base_url, &local, &FollowOptions::default()).unwrap())
    };

    // Give the follower time to replay the snapshot and open its stream,
    // then produce the live tail of the build.
    std::thread::sleep(Duration::from_millis(600));
    primary.add_done(1);
    primary.publish(event(0, "//a:x", Status::Built));
    std::thread::sleep(Duration::from_millis(300));
    server.shutdown();

    assert_eq!(follower.join().unwrap(), FollowOutcome::Completed);

    let mut thread0 = Vec::new();
    let mut thread1 = Vec::new();
    while let Ok(ev) = received.try_recv() {
        if ev.status == Status::Other {
            // The client's own end-of-stream notices.
            continue;
        }
        match ev.thread_id {
            0 => thread0.push((ev.label.to_string(), ev.status, ev.num_active, ev.num_done)),
            1 => thread1.push((ev.label.to_string(), ev.status, ev.num_active, ev.num_done)),
            _ => {}
        }
    }
    // Snapshot gave the last event per thread; the live stream finished
    // thread 0 in order. The primary's progress counters arrive verbatim,
    // never restamped with the follower's own (idle) counters.
    assert_eq!(
        thread0,
        vec![
            ("//a:x".to_owned(), Status::Building, 2, 0),
            ("//a:x".to_owned(), Status::Built, 2, 2),
        ]
    );
    assert_eq!(thread1, vec![("//b:y".to_owned(), Status::Built, 2, 1)]);
}
