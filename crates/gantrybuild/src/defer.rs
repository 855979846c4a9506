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

//! Bookkeeping for parses that cannot run or finish yet: labels waiting on
//! an in-flight parse, and packages whose parse is blocked on a subinclude
//! target that has not built.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use gantryutil::label::BuildLabel;

use crate::schedule::Mode;

/// The dependor used when a deferred parse is re-queued, so the scheduler
/// retries the parse instead of treating it as a fresh activation.
pub fn undefer_label() -> BuildLabel {
    BuildLabel::new("", "_undefer")
}

pub fn is_undefer(label: &BuildLabel) -> bool {
    label.package.is_empty() && label.name == "_undefer"
}

/// One label waiting for its package to parse.
#[derive(Debug, Clone)]
pub struct PendingActivation {
    pub name: String,
    pub dependor: BuildLabel,
    pub mode: Mode,
    pub subinclude: bool,
}

type PackageKey = (String, String);

/// Outcome of registering interest in an unparsed package.
#[derive(Debug, PartialEq, Eq)]
pub enum Registered {
    /// This caller won the token; it must enqueue the parse task.
    FirstToParse,
    /// Someone else is already parsing; the label was attached to the
    /// pending set.
    Attached,
}

/// Outcome of recording a subinclude deferral.
#[derive(Debug, PartialEq, Eq)]
pub enum Deferral {
    /// The package is now waiting on the subinclude label.
    Deferred,
    /// The subinclude already built; retry the parse immediately.
    RetryNow,
}

#[derive(Default)]
pub struct DeferRegistry {
    /// Labels whose package parse is queued or in flight.
    pending_targets: Mutex<HashMap<PackageKey, Vec<PendingActivation>>>,
    /// Subinclude label -> packages whose parse is blocked on it.
    deferred_parses: Mutex<HashMap<BuildLabel, Vec<BuildLabel>>>,
    /// Subincludes that have reached `Built`; deferrals against these are
    /// stale and are discarded on access.
    built_subincludes: Mutex<HashSet<BuildLabel>>,
}

impl DeferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a label pending its package's parse. The first registrant
    /// for a package wins the parse token.
    pub fn register_pending(
        &self,
        label: &BuildLabel,
        dependor: BuildLabel,
        mode: Mode,
        subinclude: bool,
    ) -> Registered {
        let mut pending = self.pending_targets.lock().unwrap();
        let key = (label.subrepo.clone(), label.package.clone());
        let first = !pending.contains_key(&key);
        pending.entry(key).or_default().push(PendingActivation {
            name: label.name.clone(),
            dependor,
            mode,
            subinclude,
        });
        if first {
            Registered::FirstToParse
        } else {
            Registered::Attached
        }
    }

    /// Drain every activation pending on the package, once it has parsed
    /// (or failed to).
    pub fn take_pending(&self, subrepo: &str, package: &str) -> Vec<PendingActivation> {
        self.pending_targets
            .lock()
            .unwrap()
            .remove(&(subrepo.to_owned(), package.to_owned()))
            .unwrap_or_default()
    }

    /// Peek at the pending set without draining it; the deferred-parse path
    /// leaves the set in place for the retry.
    pub fn has_pending(&self, subrepo: &str, package: &str) -> bool {
        self.pending_targets
            .lock()
            .unwrap()
            .contains_key(&(subrepo.to_owned(), package.to_owned()))
    }

    /// Record that `package` cannot parse until `subinclude` builds.
    pub fn add_deferred_parse(&self, subinclude: BuildLabel, package: BuildLabel) -> Deferral {
        if self.built_subincludes.lock().unwrap().contains(&subinclude) {
            return Deferral::RetryNow;
        }
        let mut deferred = self.deferred_parses.lock().unwrap();
        let entry = deferred.entry(subinclude).or_default();
        if !entry.contains(&package) {
            entry.push(package);
        }
        Deferral::Deferred
    }

    /// A target reached `Built`: returns every package whose parse was
    /// deferred on it, to be re-queued.
    pub fn on_subinclude_built(&self, label: &BuildLabel) -> Vec<BuildLabel> {
        self.built_subincludes
            .lock()
            .unwrap()
            .insert(label.clone());
        self.deferred_parses
            .lock()
            .unwrap()
            .remove(label)
            .unwrap_or_default()
    }

    /// A subinclude target failed: its deferred parses can never proceed.
    /// Unlike [`DeferRegistry::on_subinclude_built`] the label is not
    /// recorded as built, so later deferrals on it still register (and fail
    /// again, with the same cause).
    pub fn on_subinclude_failed(&self, label: &BuildLabel) -> Vec<BuildLabel> {
        self.deferred_parses
            .lock()
            .unwrap()
            .remove(label)
            .unwrap_or_default()
    }

    /// Packages still blocked on some subinclude; used to detect parses
    /// that can never make progress once the build winds down.
    pub fn deferred_packages(&self) -> Vec<(BuildLabel, Vec<BuildLabel>)> {
        self.deferred_parses
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registrant_wins_the_parse_token() {
        let registry = DeferRegistry::new();
        let first = registry.register_pending(
            &BuildLabel::new("p", "x"),
            BuildLabel::original_target(),
            Mode::Normal,
            false,
        );
        assert_eq!(first, Registered::FirstToParse);
        let second = registry.register_pending(
            &BuildLabel::new("p", "y"),
            BuildLabel::new("q", "z"),
            Mode::Normal,
            false,
        );
        assert_eq!(second, Registered::Attached);

        let drained = registry.take_pending("", "p");
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].name, "x");
        assert_eq!(drained[1].name, "y");
        assert!(registry.take_pending("", "p").is_empty());
    }

    #[test]
    fn deferral_after_built_is_stale() {
        let registry = DeferRegistry::new();
        let tool = BuildLabel::new("tools", "gen");
        let pkg = BuildLabel::new("p", "all");

        assert_eq!(
            registry.add_deferred_parse(tool.clone(), pkg.clone()),
            Deferral::Deferred
        );
        let requeued = registry.on_subinclude_built(&tool);
        assert_eq!(requeued, vec![pkg.clone()]);

        // A later deferral on the already-built subinclude is refused.
        assert_eq!(
            registry.add_deferred_parse(tool.clone(), pkg),
            Deferral::RetryNow
        );
        assert!(registry.on_subinclude_built(&tool).is_empty());
    }
}
