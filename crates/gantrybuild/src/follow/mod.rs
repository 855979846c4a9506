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

//! Mirroring the result bus over the network so a second process can
//! attach to a running build.
//!
//! Three endpoints, all HTTP/1.1 on one port: `/config` is a one-shot JSON
//! snapshot, `/events` and `/resources` are newline-delimited JSON server
//! streams. Slow followers are dropped, never allowed to back-pressure the
//! primary build.

pub mod client;
pub mod server;

use gantrycore::bus::BuildResult;
use gantryutil::label::BuildLabel;
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH: &str = "/config";
pub const EVENTS_PATH: &str = "/events";
pub const RESOURCES_PATH: &str = "/resources";

/// Per-client event queue length; a follower further behind than this is
/// disconnected.
pub const CLIENT_QUEUE_CAPACITY: usize = 1000;

/// One-shot snapshot a follower synchronizes from before streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub num_threads: usize,
    pub original_targets: Vec<BuildLabel>,
    pub need_tests: bool,
    pub need_coverage: bool,
    /// Nanoseconds since the unix epoch.
    pub start_time: i64,
    /// The most recent event of each worker thread.
    pub last_event_per_thread: Vec<BuildResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantrycore::bus::Status;

    #[test]
    fn config_roundtrips() {
        let config = ServerConfig {
            num_threads: 4,
            original_targets: vec![BuildLabel::new("a", "x")],
            need_tests: true,
            need_coverage: false,
            start_time: 12345,
            last_event_per_thread: vec![BuildResult::new(
                0,
                BuildLabel::new("a", "x"),
                Status::Building,
                "Building...",
            )],
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_threads, 4);
        assert_eq!(back.last_event_per_thread.len(), 1);
        assert_eq!(back.last_event_per_thread[0].status, Status::Building);
    }
}
