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

//! The explicit handle threaded through every operation of a build.
//!
//! There is deliberately no global state anywhere in this codebase; whatever
//! a code path needs, it takes from the [`BuildState`] it was handed.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use gantryutil::OUT_DIR;
use gantryutil::label::BuildLabel;

use crate::bus::{BuildResult, ResultBus, Status};
use crate::graph::BuildGraph;
use crate::target::Target;

/// Everything the command line told us about this invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Workspace root; all `plz-out` paths hang off it.
    pub root: PathBuf,
    pub need_build: bool,
    pub need_tests: bool,
    pub need_coverage: bool,
    /// Attempt siblings of a failed target instead of skipping them.
    pub keep_going: bool,
    pub keep_workdirs: bool,
    pub failing_tests_ok: bool,
    pub num_threads: usize,
    pub num_remote_executors: usize,
    pub num_test_runs: u32,
    /// Tag filters applied to `:all` / `...` expansion; exclude wins.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Per-label concurrency caps, e.g. `java=1`.
    pub limits: Vec<(String, usize)>,
    /// Filenames recognized as a package's build file, in preference order.
    pub build_file_names: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            root: PathBuf::from("."),
            need_build: true,
            need_tests: false,
            need_coverage: false,
            keep_going: false,
            keep_workdirs: false,
            failing_tests_ok: false,
            num_threads: 4,
            num_remote_executors: 0,
            num_test_runs: 1,
            include: Vec::new(),
            exclude: Vec::new(),
            limits: Vec::new(),
            build_file_names: vec!["BUILD.json".to_owned()],
        }
    }
}

/// Shared state of one build invocation: graph, options, counters and the
/// result bus. Passed by reference everywhere; never global.
pub struct BuildState {
    pub graph: BuildGraph,
    pub bus: ResultBus,
    pub options: BuildOptions,
    pub original_targets: Mutex<Vec<BuildLabel>>,
    pub start_time: chrono::DateTime<chrono::Utc>,

    /// Number of target completions required for the build to be done;
    /// a tested target counts twice (build + test).
    active: AtomicU64,
    /// Number of terminal completions observed so far.
    done: AtomicU64,
    stopping: AtomicBool,
}

impl BuildState {
    pub fn new(options: BuildOptions) -> Self {
        BuildState {
            graph: BuildGraph::new(),
            bus: ResultBus::new(),
            options,
            original_targets: Mutex::new(Vec::new()),
            start_time: chrono::Utc::now(),
            active: AtomicU64::new(0),
            done: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn add_original_target(&self, label: BuildLabel) {
        self.original_targets.lock().unwrap().push(label);
    }

    pub fn original_targets(&self) -> Vec<BuildLabel> {
        self.original_targets.lock().unwrap().clone()
    }

    pub fn add_active(&self, n: u64) {
        self.active.fetch_add(n, Ordering::AcqRel);
    }

    pub fn add_done(&self, n: u64) {
        self.done.fetch_add(n, Ordering::AcqRel);
    }

    pub fn num_active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn num_done(&self) -> u64 {
        self.done.load(Ordering::Acquire)
    }

    /// True once every counted completion has been observed.
    pub fn is_finished(&self) -> bool {
        self.num_done() >= self.num_active()
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Publish a result, stamping it with the current progress counters.
    pub fn publish(&self, mut result: BuildResult) {
        result.num_active = self.num_active();
        result.num_done = self.num_done();
        self.bus.publish(result);
    }

    pub fn publish_status(
        &self,
        thread_id: i32,
        label: BuildLabel,
        status: Status,
        description: impl Into<String>,
    ) {
        self.publish(BuildResult::new(thread_id, label, status, description));
    }

    // Persisted state layout.

    pub fn out_dir(&self) -> PathBuf {
        self.options.root.join(OUT_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.out_dir().join("log")
    }

    /// Where a target's durable outputs live: `gen` for ordinary targets,
    /// `bin` for binaries.
    pub fn target_out_dir(&self, target: &Target) -> PathBuf {
        let kind = if target.is_binary { "bin" } else { "gen" };
        self.out_dir().join(kind).join(&target.label.package)
    }

    pub fn target_out_path(&self, target: &Target, output: &str) -> PathBuf {
        self.target_out_dir(target).join(output)
    }

    /// Scratch directory a build runs in; removed on success unless
    /// `keep_workdirs` is set.
    pub fn tmp_build_dir(&self, target: &Target) -> PathBuf {
        self.out_dir()
            .join("tmp")
            .join(&target.label.package)
            .join(format!("{}._build", target.label.name))
    }

    /// Scratch directory a test run executes in.
    pub fn tmp_test_dir(&self, target: &Target) -> PathBuf {
        self.out_dir()
            .join("tmp")
            .join(&target.label.package)
            .join(format!("{}._test", target.label.name))
    }

    /// Where a test target's cached suite is persisted.
    pub fn cached_results_path(&self, target: &Target) -> PathBuf {
        self.target_out_dir(target)
            .join(format!(".test_results_{}", target.label.name))
    }

    pub fn cached_coverage_path(&self, target: &Target) -> PathBuf {
        self.target_out_dir(target)
            .join(format!(".test_coverage_{}", target.label.name))
    }

    /// Package directory in the source tree.
    pub fn package_dir(&self, package_path: &str) -> PathBuf {
        self.options.root.join(package_path)
    }

    pub fn source_path(&self, package_path: &str, src: &str) -> PathBuf {
        self.package_dir(package_path).join(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters() {
        let state = BuildState::new(BuildOptions::default());
        assert!(state.is_finished());
        state.add_active(3);
        assert!(!state.is_finished());
        state.add_done(3);
        assert!(state.is_finished());
    }

    use std::path::Path;

    #[test]
    fn layout_paths() {
        let state = BuildState::new(BuildOptions {
            root: PathBuf::from("/repo"),
            ..Default::default()
        });
        let mut t = Target::new(BuildLabel::new("src/core", "lib"));
        assert_eq!(
            state.target_out_dir(&t),
            Path::new("/repo/plz-out/gen/src/core")
        );
        t.is_binary = true;
        assert_eq!(
            state.target_out_dir(&t),
            Path::new("/repo/plz-out/bin/src/core")
        );
        assert_eq!(
            state.tmp_build_dir(&t),
            Path::new("/repo/plz-out/tmp/src/core/lib._build")
        );
        assert_eq!(
            state.tmp_test_dir(&t),
            Path::new("/repo/plz-out/tmp/src/core/lib._test")
        );
    }

    #[test]
    fn published_results_carry_counters() {
        let state = BuildState::new(BuildOptions::default());
        let rx = state.bus.subscribe("test");
        state.add_active(2);
        state.add_done(1);
        state.publish_status(
            0,
            BuildLabel::new("a", "x"),
            Status::Built,
            "Built",
        );
        let event = rx.recv().unwrap();
        assert_eq!(event.num_active, 2);
        assert_eq!(event.num_done, 1);
    }
}
