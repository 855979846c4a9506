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

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use gantryutil::label::{ALL_TARGETS, BuildLabel};
use indexmap::IndexMap;

use crate::error::BuildError;
use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PackageState {
    Parsing = 0,
    Parsed = 1,
}

/// A directory with a BUILD file; the unit of parsing.
///
/// Once `Parsed` the target set is immutable, except for additions performed
/// by an owning target's post-build callback, which run under
/// [`Package::build_callback_mutex`].
#[derive(Debug)]
pub struct Package {
    pub subrepo: String,
    pub path: String,
    /// The BUILD file this package was (or will be) parsed from.
    pub filename: PathBuf,

    state: AtomicU8,
    targets: Mutex<IndexMap<String, Arc<Target>>>,
    /// Output file -> owning target; enforces per-package output uniqueness.
    outputs: Mutex<HashMap<String, BuildLabel>>,
    /// Orders callbacks that mutate this package; held during a target's
    /// pre/post-build callback.
    pub build_callback_mutex: Mutex<()>,
}

impl Package {
    pub fn new(subrepo: impl Into<String>, path: impl Into<String>, filename: PathBuf) -> Self {
        Package {
            subrepo: subrepo.into(),
            path: path.into(),
            filename,
            state: AtomicU8::new(PackageState::Parsing as u8),
            targets: Mutex::new(IndexMap::new()),
            outputs: Mutex::new(HashMap::new()),
            build_callback_mutex: Mutex::new(()),
        }
    }

    /// The `:all` wildcard label addressing this package.
    pub fn label(&self) -> BuildLabel {
        BuildLabel::with_subrepo(self.subrepo.clone(), self.path.clone(), ALL_TARGETS)
    }

    pub fn key(&self) -> (String, String) {
        (self.subrepo.clone(), self.path.clone())
    }

    pub fn state(&self) -> PackageState {
        if self.state.load(Ordering::Acquire) == PackageState::Parsed as u8 {
            PackageState::Parsed
        } else {
            PackageState::Parsing
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.state() == PackageState::Parsed
    }

    pub fn mark_parsed(&self) {
        self.state.store(PackageState::Parsed as u8, Ordering::Release);
    }

    /// Insert a target, enforcing name and output uniqueness.
    pub fn add_target(&self, target: Arc<Target>) -> Result<(), BuildError> {
        let name = target.label.name.clone();
        {
            let mut outputs = self.outputs.lock().unwrap();
            for out in &target.outs {
                if let Some(first) = outputs.get(out) {
                    if *first != target.label {
                        return Err(BuildError::DuplicateOutput {
                            output: out.clone(),
                            first: first.clone(),
                            second: target.label.clone(),
                        });
                    }
                }
            }
            for out in &target.outs {
                outputs.insert(out.clone(), target.label.clone());
            }
        }
        let mut targets = self.targets.lock().unwrap();
        if targets.contains_key(&name) {
            return Err(BuildError::AlreadyExists(target.label.clone()));
        }
        targets.insert(name, target);
        Ok(())
    }

    pub fn target(&self, name: &str) -> Option<Arc<Target>> {
        self.targets.lock().unwrap().get(name).cloned()
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.lock().unwrap().keys().cloned().collect()
    }

    pub fn all_targets(&self) -> Vec<Arc<Target>> {
        self.targets.lock().unwrap().values().cloned().collect()
    }

    /// The target owning the given output file, if any.
    pub fn output_owner(&self, output: &str) -> Option<BuildLabel> {
        self.outputs.lock().unwrap().get(output).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg() -> Package {
        Package::new("", "src/core", PathBuf::from("src/core/BUILD.json"))
    }

    #[test]
    fn duplicate_output_is_rejected() {
        let p = pkg();
        let mut a = Target::new(BuildLabel::new("src/core", "a"));
        a.outs.push("lib.a".to_owned());
        p.add_target(Arc::new(a)).unwrap();

        let mut b = Target::new(BuildLabel::new("src/core", "b"));
        b.outs.push("lib.a".to_owned());
        let err = p.add_target(Arc::new(b)).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateOutput { .. }));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let p = pkg();
        p.add_target(Arc::new(Target::new(BuildLabel::new("src/core", "a"))))
            .unwrap();
        let err = p
            .add_target(Arc::new(Target::new(BuildLabel::new("src/core", "a"))))
            .unwrap_err();
        assert!(matches!(err, BuildError::AlreadyExists(_)));
    }

    #[test]
    fn parse_state() {
        let p = pkg();
        assert!(!p.is_parsed());
        p.mark_parsed();
        assert!(p.is_parsed());
        assert_eq!(p.label().to_string(), "//src/core:all");
    }
}
