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

//! Runtime-hash tagging of output artifacts.
//!
//! Artifacts are tagged with the runtime hash of their producing target in a
//! user-namespace extended attribute. A cache hit is only honored when the
//! recorded hash matches. Filesystems without xattr support (and non-unix
//! platforms) fall back to a sidecar file next to the artifact.

use std::io;
use std::path::{Path, PathBuf};

/// Name of the user-namespace extended attribute carrying the runtime hash.
pub const HASH_ATTR: &str = "user.gantry.runtime_hash";

const SIDECAR_SUFFIX: &str = ".gantry-hash";

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(SIDECAR_SUFFIX);
    path.with_file_name(name)
}

/// Record `hash` as the runtime hash of the artifact at `path`.
pub fn write_artifact_hash(path: &Path, hash: &str) -> io::Result<()> {
    #[cfg(unix)]
    {
        match xattr::set(path, HASH_ATTR, hash.as_bytes()) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {
                log::debug!(
                    "xattrs unsupported on {}, falling back to sidecar",
                    path.display()
                );
            }
            Err(e) => return Err(e),
        }
    }
    std::fs::write(sidecar_path(path), hash)
}

/// Read back the runtime hash recorded on `path`, if any.
pub fn read_artifact_hash(path: &Path) -> Option<String> {
    #[cfg(unix)]
    {
        if let Ok(Some(v)) = xattr::get(path, HASH_ATTR) {
            return String::from_utf8(v).ok();
        }
    }
    std::fs::read_to_string(sidecar_path(path)).ok()
}

/// Drop any recorded hash, forcing the next cache probe to miss.
pub fn clear_artifact_hash(path: &Path) {
    #[cfg(unix)]
    {
        let _ = xattr::remove(path, HASH_ATTR);
    }
    let _ = std::fs::remove_file(sidecar_path(path));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("out.bin");
        std::fs::write(&artifact, b"payload").unwrap();

        write_artifact_hash(&artifact, "abc123").unwrap();
        assert_eq!(read_artifact_hash(&artifact).as_deref(), Some("abc123"));

        clear_artifact_hash(&artifact);
        assert_eq!(read_artifact_hash(&artifact), None);
    }

    #[test]
    fn missing_artifact_has_no_hash() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_artifact_hash(&dir.path().join("nope")), None);
    }
}
