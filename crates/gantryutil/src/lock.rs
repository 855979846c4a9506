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

use std::path::Path;

use fs4::fs_std::FileExt;

pub const REPO_LOCK: &str = ".lock";

/// Process-wide flock preventing two builds from mutating the same
/// workspace concurrently. Held for the lifetime of the value; released on
/// drop, so every exit path gives it back.
pub struct RepoLock {
    _file: std::fs::File,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self._file.unlock();
    }
}

impl RepoLock {
    /// Lock `<out_dir>/.lock`, blocking if another build holds it.
    pub fn lock(out_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(out_dir)?;
        let lock_path = out_dir.join(REPO_LOCK);
        let file = std::fs::File::create(&lock_path)?;
        match file.try_lock_exclusive() {
            Ok(_) => Ok(RepoLock { _file: file }),
            Err(_) => {
                log::warn!(
                    "Blocking waiting for repo lock {} ...",
                    lock_path.display()
                );
                file.lock_exclusive()
                    .map_err(|e| std::io::Error::new(e.kind(), "failed to lock the workspace"))?;
                Ok(RepoLock { _file: file })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = RepoLock::lock(dir.path()).unwrap();
            assert!(dir.path().join(REPO_LOCK).exists());
        }
        // Re-acquiring immediately must not block.
        let _lock = RepoLock::lock(dir.path()).unwrap();
    }
}
