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

//! The priority task source feeding workers.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

use gantryutil::label::BuildLabel;

/// One unit of work a worker can pick up.
///
/// The `subinclude` variants of parse and build are the same work at a
/// higher priority: something a parse is blocked on must beat ordinary work,
/// or many parses waiting on a single generated definition would starve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Parse {
        /// `:all` label of the package to parse.
        package: BuildLabel,
        dependor: BuildLabel,
        subinclude: bool,
    },
    Build {
        label: BuildLabel,
        subinclude: bool,
    },
    Test {
        label: BuildLabel,
    },
    Stop,
}

impl Task {
    /// Higher runs first. `SubincludeBuild > SubincludeParse >
    /// {Build, Parse, Test} > Stop`.
    pub fn priority(&self) -> u8 {
        match self {
            Task::Build {
                subinclude: true, ..
            } => 3,
            Task::Parse {
                subinclude: true, ..
            } => 2,
            Task::Parse { .. } | Task::Build { .. } | Task::Test { .. } => 1,
            Task::Stop => 0,
        }
    }

    /// Parse tasks feed the parse output; everything else is an action.
    pub fn is_parse(&self) -> bool {
        matches!(self, Task::Parse { .. })
    }
}

#[derive(Debug)]
struct Entry {
    priority: u8,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: highest priority first, FIFO within a priority.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Inner {
    parses: BinaryHeap<Entry>,
    actions: BinaryHeap<Entry>,
    seq: u64,
    closed: bool,
}

/// Two ordered pending outputs (parses and actions) behind one blocking
/// handle. Workers are symmetric and take whichever head has the higher
/// priority; sequence numbers keep FIFO order within a priority across both.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Pushing to a closed queue silently drops the task;
    /// by then the build has already decided how it ends.
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let entry = Entry {
            priority: task.priority(),
            seq: inner.seq,
            task,
        };
        inner.seq += 1;
        if entry.task.is_parse() {
            inner.parses.push(entry);
        } else {
            inner.actions.push(entry);
        }
        self.available.notify_one();
    }

    /// Block until a task is available. Returns [`Task::Stop`] once the
    /// queue is closed; every waiting worker receives its own `Stop`.
    pub fn pop(&self) -> Task {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Task::Stop;
            }
            let take_parse = match (inner.parses.peek(), inner.actions.peek()) {
                (Some(p), Some(a)) => p.cmp(a) >= std::cmp::Ordering::Equal,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => {
                    inner = self.available.wait(inner).unwrap();
                    continue;
                }
            };
            let entry = if take_parse {
                inner.parses.pop()
            } else {
                inner.actions.pop()
            };
            return entry.expect("peeked entry vanished").task;
        }
    }

    /// Drain and close: queued tasks are dropped and every worker's next
    /// (and every later) pop returns `Stop`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.parses.clear();
        inner.actions.clear();
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.parses.is_empty() && inner.actions.is_empty()
    }

    /// (queued parses, queued actions), for display.
    pub fn pending(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.parses.len(), inner.actions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(pkg: &str, subinclude: bool) -> Task {
        Task::Parse {
            package: BuildLabel::new(pkg, "all"),
            dependor: BuildLabel::original_target(),
            subinclude,
        }
    }

    fn build(name: &str, subinclude: bool) -> Task {
        Task::Build {
            label: BuildLabel::new("pkg", name),
            subinclude,
        }
    }

    #[test]
    fn subinclude_work_beats_ordinary_work() {
        let q = TaskQueue::new();
        q.push(build("ordinary", false));
        q.push(parse("p", false));
        q.push(parse("sub", true));
        q.push(build("subbuild", true));

        assert_eq!(q.pop(), build("subbuild", true));
        assert_eq!(q.pop(), parse("sub", true));
        // Ordinary work drains FIFO across both outputs.
        assert_eq!(q.pop(), build("ordinary", false));
        assert_eq!(q.pop(), parse("p", false));
    }

    #[test]
    fn fifo_within_priority() {
        let q = TaskQueue::new();
        q.push(build("a", false));
        q.push(build("b", false));
        q.push(build("c", false));
        q.push(parse("p", false));
        assert_eq!(q.pending(), (1, 3));
        assert_eq!(q.pop(), build("a", false));
        assert_eq!(q.pop(), build("b", false));
        assert_eq!(q.pop(), build("c", false));
        assert_eq!(q.pop(), parse("p", false));
        assert_eq!(q.pending(), (0, 0));
    }

    #[test]
    fn close_wakes_all_waiters_with_stop() {
        let q = std::sync::Arc::new(TaskQueue::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = std::sync::Arc::clone(&q);
            handles.push(std::thread::spawn(move || q.pop()));
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        q.close();
        for h in handles {
            assert_eq!(h.join().unwrap(), Task::Stop);
        }
        // Pushes after close are dropped.
        q.push(build("late", false));
        assert!(q.is_empty());
        assert_eq!(q.pop(), Task::Stop);
    }
}
