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

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gantrycore::bus::BuildResult;
use gantrycore::state::BuildState;
use gantryutil::stats::SystemStats;
use log::{debug, warn};

use super::{CONFIG_PATH, EVENTS_PATH, RESOURCES_PATH, ServerConfig};

/// How the remote stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    /// Clean EOF: the remote build completed.
    Completed,
    /// The stream broke mid-build.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct FollowOptions {
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for FollowOptions {
    fn default() -> Self {
        FollowOptions {
            retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Attach to a running build and mirror its events into the local bus.
///
/// Dials the server (with fixed-delay retries), synchronizes configuration,
/// replays the last-event-per-thread snapshot, then consumes the event and
/// resource streams concurrently until the remote build ends.
pub fn follow(
    base_url: &str,
    state: &Arc<BuildState>,
    options: &FollowOptions,
) -> anyhow::Result<FollowOutcome> {
    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .context("cannot build the follow client")?;

    let config = fetch_config(&client, base_url, options)?;
    debug!(
        "following a build of {} targets on {} threads",
        config.original_targets.len(),
        config.num_threads
    );
    // Bootstrap late-observer state from the snapshot.
    state.bus.replay(config.last_event_per_thread.clone());

    // Resource samples ride on their own stream; losing them is harmless.
    let resources = {
        let client = client.clone();
        let url = format!("{base_url}{RESOURCES_PATH}");
        std::thread::Builder::new()
            .name("follow-resources".to_owned())
            .spawn(move || consume_resources(&client, &url))
            .context("cannot spawn the resource stream thread")?
    };

    let outcome = consume_events(&client, &format!("{base_url}{EVENTS_PATH}"), state);
    let _ = resources.join();

    match outcome {
        FollowOutcome::Completed => {
            state.publish_status(
                0,
                gantryutil::label::BuildLabel::original_target(),
                gantrycore::bus::Status::Other,
                "Remote build completed",
            );
        }
        FollowOutcome::Disconnected => {
            state.publish(
                gantrycore::BuildResult::new(
                    0,
                    gantryutil::label::BuildLabel::original_target(),
                    gantrycore::bus::Status::Other,
                    "Disconnected from the remote build",
                )
                .with_error("event stream broke before the build finished"),
            );
        }
    }
    Ok(outcome)
}

fn fetch_config(
    client: &reqwest::blocking::Client,
    base_url: &str,
    options: &FollowOptions,
) -> anyhow::Result<ServerConfig> {
    let url = format!("{base_url}{CONFIG_PATH}");
    let mut last_err = None;
    for attempt in 0..=options.retries {
        if attempt > 0 {
            std::thread::sleep(options.retry_delay);
        }
        match client.get(&url).send().and_then(|r| r.error_for_status()) {
            Ok(response) => {
                return response
                    .json::<ServerConfig>()
                    .context("cannot decode the server config");
            }
            Err(e) => {
                debug!("connect attempt {} failed: {}", attempt + 1, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow::anyhow!("no connection attempts were made"))
        .context(format!("cannot connect to {url}")))
}

/// Drain the event stream into the local bus. EOF means the remote build
/// completed; a read or decode error means we lost the follower link.
fn consume_events(
    client: &reqwest::blocking::Client,
    url: &str,
    state: &Arc<BuildState>,
) -> FollowOutcome {
    let response = match client.get(url).send().and_then(|r| r.error_for_status()) {
        Ok(r) => r,
        Err(e) => {
            warn!("cannot open the event stream: {e}");
            return FollowOutcome::Disconnected;
        }
    };
    let reader = BufReader::new(response);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("event stream broke: {e}");
                return FollowOutcome::Disconnected;
            }
        };
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<BuildResult>(&line) {
            // Straight onto the bus: the remote build's progress counters
            // must arrive untouched, not be restamped with our own.
            Ok(event) => state.bus.publish(event),
            Err(e) => {
                warn!("undecodable event from the remote build: {e}");
                return FollowOutcome::Disconnected;
            }
        }
    }
    FollowOutcome::Completed
}

fn consume_resources(client: &reqwest::blocking::Client, url: &str) {
    let response = match client.get(url).send().and_then(|r| r.error_for_status()) {
        Ok(r) => r,
        Err(e) => {
            debug!("cannot open the resource stream: {e}");
            return;
        }
    };
    let reader = BufReader::new(response);
    for line in reader.lines() {
        let Ok(line) = line else { return };
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SystemStats>(&line) {
            Ok(sample) => debug!(
                "remote load: cpu {:.0}%, mem {:.0}%, {} workers",
                sample.cpu_use,
                sample.mem_used_percent(),
                sample.num_worker_processes
            ),
            Err(e) => debug!("undecodable resource sample: {e}"),
        }
    }
}
