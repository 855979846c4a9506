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

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use gantryutil::label::BuildLabel;

use crate::error::BuildError;
use crate::package::Package;
use crate::state::BuildState;
use crate::target::Target;

/// How a parse attempt ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The package is fully populated.
    Done,
    /// Parsing hit a subinclude whose target is not built yet; retry once
    /// the carried label reaches `Built`. The parser must not have mutated
    /// the graph after signalling this.
    Deferred(BuildLabel),
}

/// The BUILD-file evaluator seam.
///
/// The core knows nothing about the DSL's syntax or semantics: whatever the
/// implementation is, it populates the given package with targets, declares
/// dependencies, sets outputs, attaches labels and registers pre/post-build
/// callback handles on targets.
pub trait Parser: Send + Sync {
    /// Evaluate a BUILD file into `package`.
    fn parse_file(
        &self,
        state: &BuildState,
        package: &Arc<Package>,
        filename: &Path,
    ) -> Result<ParseOutcome, BuildError>;

    /// Evaluate BUILD content from an arbitrary reader (used for stdin and
    /// tests). Deferral is not supported on readers.
    fn parse_reader(
        &self,
        state: &BuildState,
        package: &Arc<Package>,
        reader: &mut dyn Read,
    ) -> Result<(), BuildError>;

    /// Run the target's pre-build callback. Called under the owning
    /// package's callback mutex, immediately before the target builds.
    fn run_pre_build(&self, state: &BuildState, target: &Arc<Target>) -> Result<(), BuildError>;

    /// Run the target's post-build callback with the captured build stdout.
    /// Called under the owning package's callback mutex; may add targets and
    /// dependencies to the owning package.
    fn run_post_build(
        &self,
        state: &BuildState,
        target: &Arc<Target>,
        stdout: &str,
    ) -> Result<(), BuildError>;
}
