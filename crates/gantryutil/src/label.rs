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

//! Build label related structures

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const PACKAGE_SEGMENT_SEP: char = '/';

/// The pseudo target name matching every target in a package.
pub const ALL_TARGETS: &str = "all";

/// The pseudo target name matching every target under a package, recursively.
pub const RECURSIVE_TARGETS: &str = "...";

/// A fully-qualified identity of a build target: `@subrepo//pkg/path:name`.
///
/// `name` may be the wildcard [`ALL_TARGETS`] (every target in the package)
/// or [`RECURSIVE_TARGETS`] (every target under the package path). Two
/// sentinel labels exist besides the wildcards: [`BuildLabel::original_target`]
/// stands for "whatever the user asked for on the command line" and
/// [`BuildLabel::stdin`] means "enumerate labels from standard input".
///
/// Labels are value-like: hashable, ordered and cheap enough to clone freely.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildLabel {
    /// Subrepo the label lives in; empty for the host repository.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subrepo: String,
    /// Slash-separated package path, without the leading `//`.
    pub package: String,
    /// Target name within the package.
    pub name: String,
}

const ORIGINAL_TARGET_NAME: &str = "_original_target";
const STDIN_TARGET_NAME: &str = "_stdin";

impl BuildLabel {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            subrepo: String::new(),
            package: package.into(),
            name: name.into(),
        }
    }

    pub fn with_subrepo(
        subrepo: impl Into<String>,
        package: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            subrepo: subrepo.into(),
            package: package.into(),
            name: name.into(),
        }
    }

    /// The sentinel meaning "requested by the user".
    pub fn original_target() -> Self {
        Self::new("", ORIGINAL_TARGET_NAME)
    }

    /// The sentinel meaning "enumerate labels from standard input".
    pub fn stdin() -> Self {
        Self::new("", STDIN_TARGET_NAME)
    }

    pub fn is_original_target(&self) -> bool {
        self.package.is_empty() && self.name == ORIGINAL_TARGET_NAME
    }

    pub fn is_stdin(&self) -> bool {
        self.package.is_empty() && self.name == STDIN_TARGET_NAME
    }

    /// True for `//pkg:all` style labels.
    pub fn is_all_targets(&self) -> bool {
        self.name == ALL_TARGETS
    }

    /// True for `//pkg/...` style labels.
    pub fn is_recursive(&self) -> bool {
        self.name == RECURSIVE_TARGETS
    }

    /// The label of the package this target belongs to, as an `:all` wildcard.
    pub fn package_label(&self) -> BuildLabel {
        BuildLabel {
            subrepo: self.subrepo.clone(),
            package: self.package.clone(),
            name: ALL_TARGETS.to_owned(),
        }
    }

    /// True if both labels address the same `(subrepo, package)` pair.
    pub fn same_package(&self, other: &BuildLabel) -> bool {
        self.subrepo == other.subrepo && self.package == other.package
    }

    /// Parse a label relative to a package, accepting the `:name` shorthand.
    pub fn parse_relative(s: &str, current_package: &str) -> Result<Self, LabelParseError> {
        if let Some(name) = s.strip_prefix(':') {
            validate_name(name)?;
            return Ok(BuildLabel::new(current_package, name));
        }
        s.parse()
    }

    fn parse_absolute(subrepo: &str, s: &str) -> Result<Self, LabelParseError> {
        let rest = s
            .strip_prefix("//")
            .ok_or_else(|| LabelParseError::MissingRoot(s.to_owned()))?;
        let (package, name) = match rest.split_once(':') {
            Some((pkg, name)) => (pkg, name),
            None => {
                // `//foo/bar` is shorthand for `//foo/bar:bar`, while
                // `//foo/...` keeps the wildcard as its name.
                if rest == RECURSIVE_TARGETS || rest.ends_with("/...") {
                    let pkg = rest.trim_end_matches(RECURSIVE_TARGETS).trim_end_matches('/');
                    (pkg, RECURSIVE_TARGETS)
                } else {
                    let last = rest.rsplit(PACKAGE_SEGMENT_SEP).next().unwrap_or(rest);
                    (rest, last)
                }
            }
        };
        validate_package(package)?;
        validate_name(name)?;
        Ok(BuildLabel::with_subrepo(subrepo, package, name))
    }
}

fn validate_package(package: &str) -> Result<(), LabelParseError> {
    if package.is_empty() {
        return Ok(());
    }
    for seg in package.split(PACKAGE_SEGMENT_SEP) {
        if seg.is_empty() {
            return Err(LabelParseError::EmptyPackageSegment(package.to_owned()));
        }
        if seg == "." || seg == ".." {
            return Err(LabelParseError::PackageNotNormalized(package.to_owned()));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), LabelParseError> {
    if name.is_empty() {
        return Err(LabelParseError::EmptyName);
    }
    if name == RECURSIVE_TARGETS {
        return Ok(());
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '+' | '#')))
    {
        return Err(LabelParseError::InvalidNameChar {
            name: name.to_owned(),
            bad,
        });
    }
    Ok(())
}

impl FromStr for BuildLabel {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(LabelParseError::Empty);
        }
        if s == "-" {
            return Ok(BuildLabel::stdin());
        }
        if let Some(rest) = s.strip_prefix('@') {
            let root = rest
                .find("//")
                .ok_or_else(|| LabelParseError::MissingRoot(s.to_owned()))?;
            let (subrepo, abs) = rest.split_at(root);
            if subrepo.is_empty() {
                return Err(LabelParseError::EmptySubrepo(s.to_owned()));
            }
            return BuildLabel::parse_absolute(subrepo, abs);
        }
        if s.starts_with("//") {
            return BuildLabel::parse_absolute("", s);
        }
        if let Some(name) = s.strip_prefix(':') {
            // A bare `:name` has no package context here; the caller should
            // use `parse_relative` instead.
            validate_name(name)?;
            return Err(LabelParseError::RelativeWithoutPackage(s.to_owned()));
        }
        // `pkg/path:name` and `pkg/path` are taken relative to the repo root.
        BuildLabel::parse_absolute("", &format!("//{s}"))
    }
}

impl fmt::Display for BuildLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.subrepo.is_empty() {
            write!(f, "@{}", self.subrepo)?;
        }
        if self.is_recursive() {
            if self.package.is_empty() {
                write!(f, "//...")
            } else {
                write!(f, "//{}/...", self.package)
            }
        } else {
            write!(f, "//{}:{}", self.package, self.name)
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LabelParseError {
    #[error("empty build label")]
    Empty,
    #[error("label `{0}` is missing the `//` root marker")]
    MissingRoot(String),
    #[error("label `{0}` has an empty subrepo name")]
    EmptySubrepo(String),
    #[error("package path `{0}` contains an empty segment")]
    EmptyPackageSegment(String),
    #[error("package path `{0}` is not normalized")]
    PackageNotNormalized(String),
    #[error("target name must not be empty")]
    EmptyName,
    #[error("target name `{name}` contains invalid character `{bad}`")]
    InvalidNameChar { name: String, bad: char },
    #[error("label `{0}` is relative; it only makes sense inside a package")]
    RelativeWithoutPackage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn parse_full_labels() {
        let l: BuildLabel = "//src/core:core_lib".parse().unwrap();
        assert_eq!(l.package, "src/core");
        assert_eq!(l.name, "core_lib");
        assert_eq!(l.to_string(), "//src/core:core_lib");

        let l: BuildLabel = "//src/core".parse().unwrap();
        assert_eq!(l.name, "core");

        let l: BuildLabel = "@third_party//proto:gen".parse().unwrap();
        assert_eq!(l.subrepo, "third_party");
        assert_eq!(l.to_string(), "@third_party//proto:gen");
    }

    #[test]
    fn parse_wildcards() {
        let l: BuildLabel = "//src:all".parse().unwrap();
        assert!(l.is_all_targets());

        let l: BuildLabel = "//src/...".parse().unwrap();
        assert!(l.is_recursive());
        assert_eq!(l.package, "src");
        assert_eq!(l.to_string(), "//src/...");

        let l: BuildLabel = "//...".parse().unwrap();
        assert!(l.is_recursive());
        assert_eq!(l.package, "");
    }

    #[test]
    fn parse_relative_labels() {
        let l = BuildLabel::parse_relative(":helper", "src/core").unwrap();
        assert_eq!(l.to_string(), "//src/core:helper");

        let l = BuildLabel::parse_relative("//other:dep", "src/core").unwrap();
        assert_eq!(l.package, "other");
    }

    #[test]
    fn sentinels() {
        assert!(BuildLabel::original_target().is_original_target());
        assert!(BuildLabel::stdin().is_stdin());
        let l: BuildLabel = "-".parse().unwrap();
        assert!(l.is_stdin());
    }

    #[test]
    fn parse_errors() {
        expect![[r#"
            Err(
                EmptyPackageSegment(
                    "src//core",
                ),
            )
        "#]]
        .assert_debug_eq(&"//src//core:x".parse::<BuildLabel>());
        expect![[r#"
            Err(
                EmptyName,
            )
        "#]]
        .assert_debug_eq(&"//src:".parse::<BuildLabel>());
        assert!("//src/../core:x".parse::<BuildLabel>().is_err());
        assert!(":x".parse::<BuildLabel>().is_err());
    }

    #[test]
    fn root_package_label() {
        let l: BuildLabel = "//:root_tool".parse().unwrap();
        assert_eq!(l.package, "");
        assert_eq!(l.to_string(), "//:root_tool");
    }
}
