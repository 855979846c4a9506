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

use std::time::Duration;

use gantryutil::label::BuildLabel;

/// Every way a build can go wrong, as kinds rather than a type hierarchy.
///
/// Errors attached to a target travel to the result bus inside a
/// [`crate::BuildResult`]; the process exit code is derived from aggregated
/// results after the queues close, never from an error thrown across a
/// worker boundary.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse package //{package}: {reason}")]
    ParseFailed { package: String, reason: String },

    #[error("package //{package} failed to parse: {cause}")]
    DependencyParseFailed { package: String, cause: String },

    #[error("{label} is not a target in this package.{}", suggestion_suffix(.suggestion))]
    MissingTarget {
        label: BuildLabel,
        suggestion: Option<String>,
    },

    #[error("targets {first} and {second} both declare output `{output}`")]
    DuplicateOutput {
        output: String,
        first: BuildLabel,
        second: BuildLabel,
    },

    #[error("target {0} already exists in the graph")]
    AlreadyExists(BuildLabel),

    #[error("dependency {0} failed")]
    DependencyFailed(BuildLabel),

    #[error("dependency cycle: {}", format_cycle(.0))]
    DependencyCycle(Vec<BuildLabel>),

    #[error("build of {label} failed: {reason}")]
    BuildFailed { label: BuildLabel, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("tests of {label} failed: {reason}")]
    TestFailed { label: BuildLabel, reason: String },

    #[error("tests of {label} errored: {reason}")]
    TestError { label: BuildLabel, reason: String },

    #[error("cache entry for {0} is corrupt")]
    CacheCorrupt(BuildLabel),

    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" {s}"),
        None => String::new(),
    }
}

fn format_cycle(labels: &[BuildLabel]) -> String {
    labels
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl BuildError {
    /// True for errors that abort before any scheduling starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BuildError::Config(_) | BuildError::DuplicateOutput { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_message() {
        let err = BuildError::MissingTarget {
            label: BuildLabel::new("a", "z"),
            suggestion: Some("Maybe you meant :x ?".to_owned()),
        };
        assert_eq!(
            err.to_string(),
            "//a:z is not a target in this package. Maybe you meant :x ?"
        );

        let err = BuildError::MissingTarget {
            label: BuildLabel::new("a", "z"),
            suggestion: None,
        };
        assert_eq!(err.to_string(), "//a:z is not a target in this package.");
    }

    #[test]
    fn cycle_message() {
        let err = BuildError::DependencyCycle(vec![
            BuildLabel::new("a", "x"),
            BuildLabel::new("b", "y"),
            BuildLabel::new("a", "x"),
        ]);
        assert_eq!(err.to_string(), "dependency cycle: //a:x -> //b:y -> //a:x");
    }
}
