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

use crate::target::Target;

/// Optional artifact cache seam.
///
/// Implementations retrieve and store a target's outputs keyed by its
/// runtime hash. The core validates retrieved artifacts against the hash
/// recorded on them; a mismatch is treated as corruption, the entry is
/// cleaned and execution falls through to a fresh build.
pub trait Cache: Send + Sync {
    /// Fetch the target's outputs into place. True on a hit.
    fn retrieve(&self, target: &Target, hash: &str) -> bool;

    /// Fetch one extra (undeclared) file belonging to the target.
    fn retrieve_extra(&self, target: &Target, hash: &str, filename: &str) -> bool;

    /// Store the target's outputs under the given hash.
    fn store(&self, target: &Target, hash: &str, files: &[&Path]);

    /// Store one extra file belonging to the target.
    fn store_extra(&self, target: &Target, hash: &str, filename: &str);

    /// Drop whatever the cache holds for this target.
    fn clean(&self, target: &Target);

    /// Flush and release resources; called once when the build ends.
    fn shutdown(&self);
}
