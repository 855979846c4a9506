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

//! The build driver: interleaved parse/build/test scheduling over the
//! package and target graph, worker pools, concurrency limits, and the
//! live build-event stream a second process can follow.

mod build_step;
pub mod defer;
pub mod entry;
pub mod follow;
pub mod limiter;
pub mod queue;
pub mod schedule;
mod test_step;
pub mod worker;

pub use entry::{BuildSummary, run_build};
pub use schedule::{Mode, Scheduler};
