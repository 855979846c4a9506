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

//! Deadline-bounded subprocess execution.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM, kill};
use tracing::{trace, warn};
#[cfg(windows)]
use windows_sys::Win32::Foundation::{CloseHandle, WAIT_OBJECT_0, WAIT_TIMEOUT};
#[cfg(windows)]
use windows_sys::Win32::System::Threading::{
    OpenProcess, PROCESS_TERMINATE, SYNCHRONIZE, TerminateProcess, WaitForSingleObject,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What running a child process produced.
#[derive(Debug, Default)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// True when the deadline expired and the child was killed.
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: i32) -> bool {
    unsafe {
        if kill(pid, 0) == 0 {
            return true;
        }
        !matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::ESRCH)
        )
    }
}

#[cfg(unix)]
fn kill_pid_with_grace(pid: i32) -> std::io::Result<()> {
    unsafe {
        let _ = kill(pid, SIGTERM);
    }
    for _ in 0..5 {
        std::thread::sleep(POLL_INTERVAL);
        if !pid_is_alive(pid) {
            return Ok(());
        }
    }
    unsafe {
        let _ = kill(pid, SIGKILL);
    }
    for _ in 0..5 {
        std::thread::sleep(POLL_INTERVAL);
        if !pid_is_alive(pid) {
            return Ok(());
        }
    }
    Err(std::io::Error::other(
        "process did not exit after SIGTERM/SIGKILL",
    ))
}

#[cfg(windows)]
fn kill_pid_with_grace(pid: u32) -> std::io::Result<()> {
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE | SYNCHRONIZE, 0, pid);
        if handle == 0 {
            return Err(std::io::Error::last_os_error());
        }

        if TerminateProcess(handle, 1) == 0 {
            let err = std::io::Error::last_os_error();
            CloseHandle(handle);
            return Err(err);
        }

        let wait_result = WaitForSingleObject(handle, 2000);
        CloseHandle(handle);

        match wait_result {
            WAIT_OBJECT_0 => Ok(()),
            WAIT_TIMEOUT => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "process did not exit after terminate",
            )),
            _ => Err(std::io::Error::last_os_error()),
        }
    }
}

/// Kill the process with the given id, SIGTERM first then SIGKILL.
pub fn kill_with_grace(pid: u32) -> std::io::Result<()> {
    trace!("Attempting to kill child process {}", pid);
    #[cfg(unix)]
    {
        kill_pid_with_grace(pid as i32)
    }
    #[cfg(windows)]
    {
        kill_pid_with_grace(pid)
    }
    #[cfg(not(any(unix, windows)))]
    {
        warn!("Killing by PID is not supported on this platform");
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "killing by PID is not supported on this platform",
        ))
    }
}

/// Run `cmd` to completion, killing it if `deadline` elapses first.
///
/// Stdout and stderr are drained on separate threads so a chatty child can
/// never fill its pipes and deadlock against the polling loop.
pub fn run_with_deadline(
    cmd: &mut Command,
    deadline: Option<Duration>,
) -> std::io::Result<ExecResult> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    trace!("spawning {:?}", cmd);
    let mut child = cmd.spawn()?;
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        buf
    });
    let stderr_reader = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        buf
    });

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if let Some(limit) = deadline {
                    if started.elapsed() >= limit {
                        warn!("child {} exceeded its deadline of {:?}", pid, limit);
                        timed_out = true;
                        if let Err(e) = kill_with_grace(pid) {
                            warn!("failed to kill timed-out child {}: {}", pid, e);
                        }
                        break child.try_wait()?;
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    };
    // Reap the child if the graceful kill raced with try_wait.
    let status = match status {
        Some(s) => s,
        None => child.wait()?,
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(ExecResult {
        stdout,
        stderr,
        code: status.code(),
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn captures_output_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let res = run_with_deadline(&mut cmd, None).unwrap();
        assert_eq!(res.code, Some(3));
        assert_eq!(res.stdout_lossy(), "out\n");
        assert_eq!(res.stderr_lossy(), "err\n");
        assert!(!res.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn kills_on_deadline() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let res = run_with_deadline(&mut cmd, Some(Duration::from_millis(200))).unwrap();
        assert!(res.timed_out);
        assert!(!res.success());
    }
}
