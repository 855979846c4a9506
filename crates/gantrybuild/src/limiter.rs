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

//! Concurrency caps keyed by target labels, e.g. "at most one java build
//! at a time".
//!
//! A capped task is never held by a worker: it goes back to the queue and
//! the worker picks up something else, so a slot is never blocked waiting
//! on itself and there is no head-of-line blocking. Releasing a slot wakes
//! at most one parked task.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use gantrycore::Target;

use crate::queue::{Task, TaskQueue};

struct LimitEntry {
    max: usize,
    current: usize,
    waiting: VecDeque<Task>,
}

#[derive(Default)]
pub struct Limiter {
    limits: Mutex<HashMap<String, LimitEntry>>,
}

impl Limiter {
    pub fn new(limits: &[(String, usize)]) -> Self {
        let mut map = HashMap::new();
        for (label, max) in limits {
            map.insert(
                label.clone(),
                LimitEntry {
                    max: (*max).max(1),
                    current: 0,
                    waiting: VecDeque::new(),
                },
            );
        }
        Limiter {
            limits: Mutex::new(map),
        }
    }

    /// Try to take a slot for every configured label the target carries.
    ///
    /// On success all matched counts are incremented and the caller may run
    /// the task. On refusal nothing is taken; the task is parked against the
    /// saturated label and re-enqueued by [`Limiter::done`] when a slot
    /// frees up.
    pub fn try_start(&self, target: &Target, task: &Task) -> bool {
        let mut limits = self.limits.lock().unwrap();
        for label in &target.labels {
            if let Some(entry) = limits.get_mut(label) {
                if entry.current >= entry.max {
                    log::debug!(
                        "{} is capped on `{}` ({}/{}), requeueing",
                        target.label,
                        label,
                        entry.current,
                        entry.max
                    );
                    entry.waiting.push_back(task.clone());
                    return false;
                }
            }
        }
        for label in &target.labels {
            if let Some(entry) = limits.get_mut(label) {
                entry.current += 1;
            }
        }
        true
    }

    /// Release every slot the target took; wakes at most one parked task
    /// per freed label by pushing it back onto the queue.
    pub fn done(&self, target: &Target, queue: &TaskQueue) {
        let mut limits = self.limits.lock().unwrap();
        for label in &target.labels {
            if let Some(entry) = limits.get_mut(label) {
                entry.current = entry.current.saturating_sub(1);
                if let Some(task) = entry.waiting.pop_front() {
                    queue.push(task);
                }
            }
        }
    }

    /// The current count held against a label, for tests and display.
    pub fn current(&self, label: &str) -> usize {
        self.limits
            .lock()
            .unwrap()
            .get(label)
            .map_or(0, |e| e.current)
    }
}
