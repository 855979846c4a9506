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

//! The local shell executor: runs target commands in their prepared
//! scratch directories with the documented environment, under the target's
//! own deadline.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use gantrycore::error::BuildError;
use gantrycore::execute::{ExecOutput, Executor};
use gantrycore::state::BuildState;
use gantrycore::target::Target;
use gantryutil::process::run_with_deadline;
use log::debug;

/// Builds that declare no timeout still get cut off eventually.
const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Default)]
pub struct ShellExecutor {}

impl ShellExecutor {
    pub fn new() -> Self {
        ShellExecutor {}
    }

    fn command(cmd_line: &str, dir: &Path) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let mut c = Command::new("sh");
            c.args(["-c", cmd_line]);
            c
        };
        #[cfg(windows)]
        let mut cmd = {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd_line]);
            c
        };
        cmd.current_dir(dir);
        cmd
    }

    fn apply_env(cmd: &mut Command, state: &BuildState, target: &Target, dir: &Path) {
        cmd.env("PKG", &target.label.package)
            .env("NAME", &target.label.name)
            .env("OUT", target.outs.join(" "))
            .env("SRCS", target.srcs.join(" "))
            .env("TESTS", "")
            .env("TMP_DIR", dir)
            .env("HOME", dir)
            .env("ROOT", &state.options.root);
    }

    fn run(
        cmd_line: &str,
        state: &BuildState,
        target: &Target,
        dir: &Path,
        deadline: Duration,
    ) -> Result<ExecOutput, BuildError> {
        let mut cmd = Self::command(cmd_line, dir);
        Self::apply_env(&mut cmd, state, target, dir);
        debug!("{}: running `{}` in {}", target.label, cmd_line, dir.display());
        let result =
            run_with_deadline(&mut cmd, Some(deadline)).map_err(|e| BuildError::BuildFailed {
                label: target.label.clone(),
                reason: format!("cannot run command: {e}"),
            })?;
        if result.timed_out {
            return Err(BuildError::Timeout(deadline));
        }
        Ok(ExecOutput {
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            code: result.code,
        })
    }
}

impl Executor for ShellExecutor {
    fn build(&self, state: &BuildState, target: &Arc<Target>) -> Result<ExecOutput, BuildError> {
        let dir = state.tmp_build_dir(target);
        let deadline = target.build_timeout.unwrap_or(DEFAULT_BUILD_TIMEOUT);
        let out = Self::run(&target.command, state, target, &dir, deadline)?;
        if !out.success() {
            let mut reason = format!("command exited with {:?}", out.code);
            let stderr = out.stderr.trim();
            if !stderr.is_empty() {
                reason.push_str(": ");
                reason.push_str(stderr);
            }
            return Err(BuildError::BuildFailed {
                label: target.label.clone(),
                reason,
            });
        }
        Ok(out)
    }

    fn test(
        &self,
        state: &BuildState,
        target: &Arc<Target>,
        run: u32,
    ) -> Result<ExecOutput, BuildError> {
        let dir = state.tmp_test_dir(target);
        let cmd_line = if target.test_command.is_empty() {
            &target.command
        } else {
            &target.test_command
        };
        let deadline = target.test_timeout.unwrap_or(DEFAULT_TEST_TIMEOUT);
        let mut cmd = Self::command(cmd_line, &dir);
        Self::apply_env(&mut cmd, state, target, &dir);
        cmd.env("RUN", run.to_string());
        debug!("{}: testing with `{}` (run {})", target.label, cmd_line, run);
        let result =
            run_with_deadline(&mut cmd, Some(deadline)).map_err(|e| BuildError::TestError {
                label: target.label.clone(),
                reason: format!("cannot run test command: {e}"),
            })?;
        if result.timed_out {
            return Err(BuildError::Timeout(deadline));
        }
        // Non-zero exits are data here: the test step owns the
        // exit/results matrix.
        Ok(ExecOutput {
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            code: result.code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantrycore::state::BuildOptions;
    use gantryutil::label::BuildLabel;

    #[cfg(unix)]
    #[test]
    fn build_runs_in_the_scratch_dir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let state = BuildState::new(BuildOptions {
            root: dir.path().to_path_buf(),
            ..Default::default()
        });
        let mut target = Target::new(BuildLabel::new("src/app", "hello"));
        target.outs = vec!["hello.txt".to_owned()];
        target.command = "echo \"$PKG:$NAME\" > \"$OUT\"".to_owned();
        let target = Arc::new(target);

        std::fs::create_dir_all(state.tmp_build_dir(&target)).unwrap();
        let out = ShellExecutor::new().build(&state, &target).unwrap();
        assert!(out.success());
        let written =
            std::fs::read_to_string(state.tmp_build_dir(&target).join("hello.txt")).unwrap();
        assert_eq!(written.trim(), "src/app:hello");
    }

    #[cfg(unix)]
    #[test]
    fn failing_build_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let state = BuildState::new(BuildOptions {
            root: dir.path().to_path_buf(),
            ..Default::default()
        });
        let mut target = Target::new(BuildLabel::new("src/app", "bad"));
        target.command = "echo broken >&2; exit 3".to_owned();
        let target = Arc::new(target);

        std::fs::create_dir_all(state.tmp_build_dir(&target)).unwrap();
        let err = ShellExecutor::new().build(&state, &target).unwrap_err();
        match err {
            BuildError::BuildFailed { reason, .. } => {
                assert!(reason.contains("broken"), "reason was: {reason}")
            }
            other => panic!("expected BuildFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn timeout_maps_to_the_timeout_kind() {
        let dir = tempfile::tempdir().unwrap();
        let state = BuildState::new(BuildOptions {
            root: dir.path().to_path_buf(),
            ..Default::default()
        });
        let mut target = Target::new(BuildLabel::new("src/app", "slow"));
        target.command = "sleep 30".to_owned();
        target.build_timeout = Some(Duration::from_millis(200));
        let target = Arc::new(target);

        std::fs::create_dir_all(state.tmp_build_dir(&target)).unwrap();
        let err = ShellExecutor::new().build(&state, &target).unwrap_err();
        assert!(matches!(err, BuildError::Timeout(_)));
    }
}
