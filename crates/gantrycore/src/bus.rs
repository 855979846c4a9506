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

//! The in-process fan-out of build and test events.
//!
//! Every state transition, parse result and test result is published here
//! exactly once. Subscribers get their own bounded queue; a subscriber that
//! stops draining is dropped rather than ever back-pressuring the build.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use gantryutil::label::BuildLabel;
use serde::{Deserialize, Serialize};

use crate::results::TestSuite;

/// Bounded queue capacity per subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 1000;

/// What a [`BuildResult`] reports about its label.
///
/// Followers must tolerate statuses they do not know; anything unknown on
/// the wire maps to [`Status::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Parsing,
    Parsed,
    ParseFailed,
    Building,
    Built,
    /// Reused outputs that were already up to date on disk.
    Reused,
    /// Retrieved from the artifact cache.
    Cached,
    BuildFailed,
    Testing,
    Tested,
    TestFailed,
    Stopped,
    #[serde(other)]
    Other,
}

impl Status {
    /// True once the label needs no further work this invocation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::ParseFailed
                | Status::Built
                | Status::Reused
                | Status::Cached
                | Status::BuildFailed
                | Status::Tested
                | Status::TestFailed
                | Status::Stopped
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Status::ParseFailed | Status::BuildFailed | Status::TestFailed
        )
    }
}

/// One event on the bus: a worker reporting progress on a label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub thread_id: i32,
    /// Nanoseconds since the unix epoch.
    pub timestamp: i64,
    pub label: BuildLabel,
    pub status: Status,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSuite>,
    pub num_active: u64,
    pub num_done: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl BuildResult {
    pub fn new(
        thread_id: i32,
        label: BuildLabel,
        status: Status,
        description: impl Into<String>,
    ) -> Self {
        BuildResult {
            thread_id,
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            label,
            status,
            description: description.into(),
            error: None,
            tests: None,
            num_active: 0,
            num_done: 0,
            labels: Vec::new(),
        }
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_tests(mut self, tests: TestSuite) -> Self {
        self.tests = Some(tests);
        self
    }

    /// Attach the target's free-form labels for followers that filter on
    /// them.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

struct Subscriber {
    name: String,
    sender: SyncSender<BuildResult>,
}

/// Fan-out channel for [`BuildResult`]s.
///
/// Keeps a "last event per thread" snapshot so late observers (a follower
/// attaching mid-build) can bootstrap their display.
#[derive(Default)]
pub struct ResultBus {
    subscribers: Mutex<Vec<Subscriber>>,
    last_per_thread: Mutex<HashMap<i32, BuildResult>>,
}

impl ResultBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new subscriber with its own bounded queue.
    pub fn subscribe(&self, name: impl Into<String>) -> Receiver<BuildResult> {
        let (sender, receiver) = sync_channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().unwrap().push(Subscriber {
            name: name.into(),
            sender,
        });
        receiver
    }

    /// Publish an event to every subscriber. Never blocks: a subscriber
    /// whose queue is full (or gone) is disconnected and dropped.
    pub fn publish(&self, result: BuildResult) {
        self.last_per_thread
            .lock()
            .unwrap()
            .insert(result.thread_id, result.clone());

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| match s.sender.try_send(result.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("result subscriber `{}` is too slow, dropping it", s.name);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// The most recent event of each worker thread, for bootstrapping late
    /// observers.
    pub fn snapshot(&self) -> Vec<BuildResult> {
        let last = self.last_per_thread.lock().unwrap();
        let mut events: Vec<BuildResult> = last.values().cloned().collect();
        events.sort_by_key(|e| e.thread_id);
        events
    }

    /// Replay a snapshot received from elsewhere (the follow client's
    /// bootstrap) as if those events had been published locally.
    pub fn replay(&self, events: Vec<BuildResult>) {
        for event in events {
            self.publish(event);
        }
    }
}
