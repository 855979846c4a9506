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

use std::sync::Arc;

use crate::error::BuildError;
use crate::state::BuildState;
use crate::target::Target;

/// What running a target's command produced.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `None` when the process died to a signal.
    pub code: Option<i32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// The action-execution seam: runs a command in a prepared directory and
/// reports output and exit status. Compilers, test binaries and sandboxing
/// all live behind this.
pub trait Executor: Send + Sync {
    /// Build the target. On success its declared outputs must exist on disk
    /// in the scratch build directory. A non-zero exit is an `Err`
    /// (`BuildFailed`), as is exceeding the target's build timeout
    /// (`Timeout`).
    fn build(&self, state: &BuildState, target: &Arc<Target>) -> Result<ExecOutput, BuildError>;

    /// Run the target's test command (the `run`-th outer run). Writes
    /// `test.results` (and `test.coverage` when coverage is requested) into
    /// the test directory. A non-zero exit is still `Ok`: the caller owns
    /// the exit/results matrix. `Err` means the process could not run at
    /// all, or timed out.
    fn test(
        &self,
        state: &BuildState,
        target: &Arc<Target>,
        run: u32,
    ) -> Result<ExecOutput, BuildError>;

    /// Remote variant of [`Executor::build`]; defaults to building locally.
    fn build_remotely(
        &self,
        state: &BuildState,
        target: &Arc<Target>,
    ) -> Result<ExecOutput, BuildError> {
        self.build(state, target)
    }

    /// Remote variant of [`Executor::test`]; defaults to testing locally.
    fn test_remotely(
        &self,
        state: &BuildState,
        target: &Arc<Target>,
        run: u32,
    ) -> Result<ExecOutput, BuildError> {
        self.test(state, target, run)
    }
}
