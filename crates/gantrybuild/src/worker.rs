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

//! The symmetric worker pools pulling tasks off the queue.
//!
//! Two pools run simultaneously: `num_threads` local workers and
//! `num_remote_executors` remote ones. Both consume the same task queues; a
//! `local = true` target is never taken by a remote worker (it goes back to
//! the queue for a local one).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gantrycore::bus::Status;
use gantrycore::error::BuildError;
use gantrycore::results::{FailureKind, TestCase, TestExecution, TestOutcome, TestSuite};
use log::{debug, error};

use crate::queue::Task;
use crate::schedule::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Local,
    Remote,
}

/// Handles to every running worker; joined when the build ends.
pub struct WorkerPools {
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPools {
    /// Spawn the local and remote pools. `subprocess_count` is shared with
    /// the resource sampler so followers can see how many worker processes
    /// are running.
    pub fn start(scheduler: Arc<Scheduler>, subprocess_count: Arc<AtomicUsize>) -> WorkerPools {
        let num_local = scheduler.state.options.num_threads.max(1);
        let num_remote = scheduler.state.options.num_remote_executors;
        let mut handles = Vec::with_capacity(num_local + num_remote);
        for tid in 0..num_local {
            handles.push(spawn_worker(
                Arc::clone(&scheduler),
                PoolKind::Local,
                tid as i32,
                Arc::clone(&subprocess_count),
            ));
        }
        for i in 0..num_remote {
            handles.push(spawn_worker(
                Arc::clone(&scheduler),
                PoolKind::Remote,
                (num_local + i) as i32,
                Arc::clone(&subprocess_count),
            ));
        }
        WorkerPools { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                // A panic that escaped the catch_unwind below; run_task has
                // already reported whatever it could.
                error!("a worker thread died unrecoverably");
            }
        }
    }
}

fn spawn_worker(
    scheduler: Arc<Scheduler>,
    pool: PoolKind,
    tid: i32,
    subprocess_count: Arc<AtomicUsize>,
) -> std::thread::JoinHandle<()> {
    let name = match pool {
        PoolKind::Local => format!("worker-{tid}"),
        PoolKind::Remote => format!("remote-worker-{tid}"),
    };
    std::thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(&scheduler, pool, tid, &subprocess_count))
        .expect("failed to spawn a worker thread")
}

fn worker_loop(
    scheduler: &Scheduler,
    pool: PoolKind,
    tid: i32,
    subprocess_count: &AtomicUsize,
) {
    loop {
        let task = scheduler.queue.pop();
        if task == Task::Stop {
            debug!("worker {} stopping", tid);
            return;
        }
        scheduler.begin_task();
        let result = catch_unwind(AssertUnwindSafe(|| {
            run_task(scheduler, pool, tid, task.clone(), subprocess_count);
        }));
        if let Err(panic) = result {
            let message = panic_message(panic);
            error!("worker {} crashed on {:?}: {}", tid, task, message);
            report_crash(scheduler, tid, &task, message, subprocess_count);
        }
        scheduler.finish_task();
    }
}

fn run_task(
    scheduler: &Scheduler,
    pool: PoolKind,
    tid: i32,
    task: Task,
    subprocess_count: &AtomicUsize,
) {
    match &task {
        Task::Parse {
            package,
            dependor,
            subinclude,
        } => scheduler.handle_parse(tid, package.clone(), dependor.clone(), *subinclude),
        Task::Build { label, .. } | Task::Test { label } => {
            let Some(target) = scheduler.state.graph.target(label) else {
                debug!("dropping task for unknown target {}", label);
                return;
            };
            if pool == PoolKind::Remote && target.local {
                // Not ours; hand it back for a local worker. The short nap
                // keeps a remote pool from spinning on a local-only queue.
                scheduler.queue.push(task.clone());
                std::thread::sleep(Duration::from_millis(20));
                return;
            }
            if !scheduler.limiter.try_start(&target, &task) {
                // Parked against its limit label; pick up something else.
                return;
            }
            subprocess_count.fetch_add(1, Ordering::Relaxed);
            match &task {
                Task::Build { subinclude, .. } => {
                    scheduler.handle_build(tid, pool, &target, *subinclude)
                }
                Task::Test { .. } => scheduler.handle_test(tid, pool, &target),
                _ => unreachable!(),
            }
            subprocess_count.fetch_sub(1, Ordering::Relaxed);
            scheduler.limiter.done(&target, &scheduler.queue);
        }
        Task::Stop => {}
    }
}

/// Convert a recovered worker panic into a `WorkerCrashed` result for the
/// task's label; the worker itself continues.
///
/// Panics can only escape from inside the build/test handlers, so for
/// those tasks the limiter slots and the subprocess count were taken and
/// must be given back here.
fn report_crash(
    scheduler: &Scheduler,
    tid: i32,
    task: &Task,
    message: String,
    subprocess_count: &AtomicUsize,
) {
    let err = BuildError::WorkerCrashed(message);
    match task {
        Task::Parse { package, .. } => {
            scheduler.parse_failed(tid, package, err);
        }
        Task::Build { label, .. } => match scheduler.state.graph.target(label) {
            Some(target) => {
                subprocess_count.fetch_sub(1, Ordering::Relaxed);
                scheduler.limiter.done(&target, &scheduler.queue);
                scheduler.fail_target(tid, &target, err);
            }
            None => scheduler.record_failure(tid, label.clone(), err),
        },
        Task::Test { label } => {
            let mut result =
                gantrycore::BuildResult::new(tid, label.clone(), Status::TestFailed, "Crashed")
                    .with_error(&err);
            if let Some(target) = scheduler.state.graph.target(label) {
                subprocess_count.fetch_sub(1, Ordering::Relaxed);
                scheduler.limiter.done(&target, &scheduler.queue);
                // Leave a suite behind: without one the finalizer takes the
                // target for "built but never tested" and settles its test
                // completion a second time.
                if target.results().is_none() {
                    target.set_results(crashed_suite(&target.label, &err));
                }
                if let Some(suite) = target.results() {
                    result = result.with_tests(suite);
                }
            }
            // The target is already Built; only the test completion is owed.
            scheduler.state.publish(result);
            scheduler.state.add_done(1);
        }
        Task::Stop => {}
    }
}

/// The suite reported for a test whose worker panicked mid-run.
fn crashed_suite(label: &gantryutil::label::BuildLabel, err: &BuildError) -> TestSuite {
    let mut suite = TestSuite::new(label.package.clone(), label.name.clone());
    let mut case = TestCase::new(label.name.clone());
    case.executions.push(TestExecution {
        outcome: TestOutcome::Error {
            kind: FailureKind::Other("WorkerCrashed".to_owned()),
            message: err.to_string(),
            traceback: None,
        },
        stdout: None,
        stderr: None,
    });
    suite.add_case(case);
    suite
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
