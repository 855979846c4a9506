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

//! The shared data model of the build driver: the build graph, packages and
//! targets with their state machines, the result bus, test results and
//! coverage, plus the capability traits the driver consumes (parser,
//! executor, cache, result reader).

pub mod bus;
pub mod cache;
pub mod coverage;
pub mod error;
pub mod execute;
pub mod graph;
pub mod package;
pub mod parse;
pub mod results;
pub mod state;
pub mod target;

pub use bus::{BuildResult, ResultBus, Status};
pub use error::BuildError;
pub use graph::BuildGraph;
pub use package::Package;
pub use state::{BuildOptions, BuildState};
pub use target::{Target, TargetState};
