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

//! The declarative `BUILD.json` package reader.
//!
//! This is the shipped stand-in for the BUILD-file evaluator seam: packages
//! are described as JSON data rather than an executable DSL, read leniently
//! the same way `moon.pkg.json`-style files are. A full DSL interpreter
//! would implement the same `Parser` trait.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gantrycore::error::BuildError;
use gantrycore::package::Package;
use gantrycore::parse::{ParseOutcome, Parser};
use gantrycore::state::BuildState;
use gantrycore::target::{Target, TargetState};
use gantryutil::label::BuildLabel;
use log::debug;
use serde::Deserialize;

/// On-disk shape of one target declaration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetJson {
    #[serde(default)]
    srcs: Vec<String>,
    #[serde(default)]
    outs: Vec<String>,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    test_cmd: String,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    binary: bool,
    #[serde(default)]
    test: bool,
    #[serde(default)]
    test_only: bool,
    #[serde(default)]
    no_test_output: bool,
    #[serde(default)]
    local: bool,
    #[serde(default)]
    flaky: u32,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    test_timeout_secs: Option<u64>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    provides: HashMap<String, String>,
}

/// On-disk shape of a whole BUILD file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildFileJson {
    /// Labels whose outputs this file's evaluation depends on; all of them
    /// must be built before the targets below can be trusted.
    #[serde(default)]
    subinclude: Vec<String>,
    #[serde(default)]
    targets: indexmap::IndexMap<String, TargetJson>,
}

#[derive(Default)]
pub struct JsonParser {}

impl JsonParser {
    pub fn new() -> Self {
        JsonParser {}
    }

    fn parse_error(package: &Package, reason: impl Into<String>) -> BuildError {
        BuildError::ParseFailed {
            package: package.path.clone(),
            reason: reason.into(),
        }
    }

    fn populate(
        &self,
        state: &BuildState,
        package: &Arc<Package>,
        decl: BuildFileJson,
    ) -> Result<ParseOutcome, BuildError> {
        // Subincludes first: if any is not yet built we must defer before
        // touching the graph at all.
        for sub in &decl.subinclude {
            let label: BuildLabel = BuildLabel::parse_relative(sub, &package.path)
                .map_err(|e| Self::parse_error(package, e.to_string()))?;
            let built = state
                .graph
                .target(&label)
                .is_some_and(|t| t.state() == TargetState::Built);
            if !built {
                debug!("//{} defers on subinclude {}", package.path, label);
                return Ok(ParseOutcome::Deferred(label));
            }
        }

        let mut deps: Vec<(BuildLabel, BuildLabel)> = Vec::new();
        for (name, t) in decl.targets {
            let label = BuildLabel::with_subrepo(
                package.subrepo.clone(),
                package.path.clone(),
                name.clone(),
            );
            let mut target = Target::new(label.clone());
            target.srcs = t.srcs;
            target.outs = t.outs;
            target.command = t.cmd;
            target.test_command = t.test_cmd;
            target.labels = t.labels;
            target.is_binary = t.binary;
            target.is_test = t.test;
            target.test_only = t.test_only;
            target.no_test_output = t.no_test_output;
            target.local = t.local;
            target.flakiness = t.flaky;
            target.build_timeout = t.timeout_secs.map(Duration::from_secs);
            target.test_timeout = t.test_timeout_secs.map(Duration::from_secs);
            target.requires = t.requires;
            for (lang, provided) in t.provides {
                let provided = BuildLabel::parse_relative(&provided, &package.path)
                    .map_err(|e| Self::parse_error(package, e.to_string()))?;
                target.provides.insert(lang, provided);
            }
            for dep in t.deps {
                let dep = BuildLabel::parse_relative(&dep, &package.path)
                    .map_err(|e| Self::parse_error(package, e.to_string()))?;
                deps.push((label.clone(), dep));
            }
            state.graph.add_target(package, target)?;
        }
        // Declare edges once every local target exists, so intra-package
        // references resolve no matter their order in the file.
        for (from, to) in deps {
            state.graph.add_dependency(&from, to)?;
        }
        Ok(ParseOutcome::Done)
    }
}

impl Parser for JsonParser {
    fn parse_file(
        &self,
        state: &BuildState,
        package: &Arc<Package>,
        filename: &Path,
    ) -> Result<ParseOutcome, BuildError> {
        let file = std::fs::File::open(filename)
            .map_err(|e| Self::parse_error(package, format!("cannot open build file: {e}")))?;
        let reader = std::io::BufReader::new(file);
        let decl: BuildFileJson = serde_json_lenient::from_reader(reader)
            .map_err(|e| Self::parse_error(package, e.to_string()))?;
        self.populate(state, package, decl)
    }

    fn parse_reader(
        &self,
        state: &BuildState,
        package: &Arc<Package>,
        reader: &mut dyn Read,
    ) -> Result<(), BuildError> {
        let decl: BuildFileJson = serde_json_lenient::from_reader(reader)
            .map_err(|e| Self::parse_error(package, e.to_string()))?;
        match self.populate(state, package, decl)? {
            ParseOutcome::Done => Ok(()),
            ParseOutcome::Deferred(label) => Err(Self::parse_error(
                package,
                format!("cannot defer on {label} when parsing from a reader"),
            )),
        }
    }

    fn run_pre_build(&self, _state: &BuildState, target: &Arc<Target>) -> Result<(), BuildError> {
        // Declarative packages have no executable callbacks.
        debug!("no pre-build callback for {}", target.label);
        Ok(())
    }

    fn run_post_build(
        &self,
        _state: &BuildState,
        target: &Arc<Target>,
        _stdout: &str,
    ) -> Result<(), BuildError> {
        debug!("no post-build callback for {}", target.label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantrycore::state::BuildOptions;

    fn parse_str(content: &str) -> (Arc<BuildState>, Arc<Package>, Result<ParseOutcome, BuildError>) {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(BuildState::new(BuildOptions {
            root: dir.path().to_path_buf(),
            ..Default::default()
        }));
        let package = Arc::new(Package::new(
            "",
            "src/app",
            dir.path().join("src/app/BUILD.json"),
        ));
        let parser = JsonParser::new();
        let mut reader = content.as_bytes();
        let result = parser
            .parse_reader(&state, &package, &mut reader)
            .map(|_| ParseOutcome::Done);
        (state, package, result)
    }

    #[test]
    fn parses_targets_and_deps() {
        let (state, package, result) = parse_str(
            r#"{
                "targets": {
                    "bin": {"srcs": ["main.c"], "outs": ["app"], "cmd": "cc", "binary": true, "deps": [":lib"]},
                    "lib": {"srcs": ["lib.c"], "outs": ["lib.a"], "cmd": "ar"}
                }
            }"#,
        );
        result.unwrap();
        assert_eq!(package.target_names(), vec!["bin", "lib"]);
        let bin = state.graph.target(&BuildLabel::new("src/app", "bin")).unwrap();
        assert!(bin.is_binary);
        assert_eq!(bin.deps(), vec![BuildLabel::new("src/app", "lib")]);
    }

    #[test]
    fn duplicate_outputs_fail_the_parse() {
        let (_state, _package, result) = parse_str(
            r#"{
                "targets": {
                    "a": {"outs": ["same.bin"]},
                    "b": {"outs": ["same.bin"]}
                }
            }"#,
        );
        assert!(matches!(
            result.unwrap_err(),
            BuildError::DuplicateOutput { .. }
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let (_state, _package, result) = parse_str(r#"{"tragets": {}}"#);
        assert!(matches!(result.unwrap_err(), BuildError::ParseFailed { .. }));
    }
}
