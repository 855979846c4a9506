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

//! The local progress renderer: one line per interesting bus event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use colored::Colorize;
use gantrycore::bus::{BuildResult, Status};

pub struct Monitor {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Monitor {
    pub fn start(events: Receiver<BuildResult>, plain: bool) -> Monitor {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("monitor".to_owned())
            .spawn(move || run(&events, plain, &stop2))
            .expect("failed to spawn the monitor thread");
        Monitor {
            stop,
            handle: Some(handle),
        }
    }

    /// Drain whatever is already queued, then stop rendering.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(events: &Receiver<BuildResult>, plain: bool, stop: &AtomicBool) {
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => render(&event, plain),
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) {
                    // One final drain so late events still show up.
                    while let Ok(event) = events.try_recv() {
                        render(&event, plain);
                    }
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn render(event: &BuildResult, plain: bool) {
    // Transient statuses would just be noise at one line per event.
    let interesting = matches!(
        event.status,
        Status::Parsed
            | Status::ParseFailed
            | Status::Built
            | Status::Reused
            | Status::Cached
            | Status::BuildFailed
            | Status::Tested
            | Status::TestFailed
            | Status::Stopped
            | Status::Other
    );
    if !interesting {
        return;
    }
    let progress = format!("[{}/{}]", event.num_done, event.num_active);
    let line = match &event.error {
        Some(error) => format!(
            "{progress} {} {}: {}",
            event.label, event.description, error
        ),
        None => format!("{progress} {} {}", event.label, event.description),
    };
    if plain {
        println!("{line}");
        return;
    }
    let line = if event.status.is_failure() {
        line.red().to_string()
    } else {
        match event.status {
            Status::Built | Status::Tested => line.green().to_string(),
            Status::Reused | Status::Cached => line.dimmed().to_string(),
            _ => line,
        }
    };
    println!("{line}");
}
