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

//! JSON readers for `test.results` and `test.coverage`.
//!
//! `test.results` is JSON lines, one object per test case execution:
//! `{"name": "...", "status": "pass|fail|error|skip", "message": "...",
//! "traceback": "...", "duration_ms": 12}`. Other formats (JUnit XML and
//! friends) would implement the same `ResultReader` seam.

use std::path::Path;
use std::time::Duration;

use gantrycore::coverage::{LineCoverage, TestCoverage};
use gantrycore::error::BuildError;
use gantrycore::results::{
    FailureKind, ResultReader, TestCase, TestExecution, TestOutcome, TestSuite,
};
use gantrycore::target::Target;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CaseLine {
    name: String,
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    traceback: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoverageJson {
    files: indexmap::IndexMap<String, String>,
}

#[derive(Default)]
pub struct JsonResultReader {}

impl JsonResultReader {
    pub fn new() -> Self {
        JsonResultReader {}
    }
}

impl ResultReader for JsonResultReader {
    fn read_results(&self, target: &Target, results_file: &Path) -> Result<TestSuite, BuildError> {
        let unparseable = |reason: String| BuildError::TestError {
            label: target.label.clone(),
            reason,
        };
        let content = std::fs::read_to_string(results_file)
            .map_err(|e| unparseable(format!("cannot read results: {e}")))?;

        let mut suite = TestSuite::new(target.label.package.clone(), target.label.name.clone());
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: CaseLine = serde_json_lenient::from_str(line)
                .map_err(|e| unparseable(format!("bad results line {}: {e}", lineno + 1)))?;
            let duration = parsed.duration_ms.map(Duration::from_millis);
            let outcome = match parsed.status.as_str() {
                "pass" => TestOutcome::Success { duration },
                "skip" => TestOutcome::Skipped {
                    message: parsed.message,
                },
                "fail" => TestOutcome::Failure {
                    kind: FailureKind::TestFailed,
                    message: parsed.message,
                    traceback: parsed.traceback,
                },
                "error" => TestOutcome::Error {
                    kind: FailureKind::Other("TestError".to_owned()),
                    message: parsed.message,
                    traceback: parsed.traceback,
                },
                other => {
                    return Err(unparseable(format!(
                        "bad results line {}: unknown status `{other}`",
                        lineno + 1
                    )));
                }
            };
            let execution = TestExecution {
                outcome,
                stdout: parsed.stdout,
                stderr: parsed.stderr,
            };
            match suite.cases.iter_mut().find(|c| c.name == parsed.name) {
                Some(case) => case.executions.push(execution),
                None => {
                    let mut case = TestCase::new(parsed.name);
                    case.executions.push(execution);
                    suite.add_case(case);
                }
            }
        }
        if suite.cases.is_empty() {
            return Err(unparseable("results file contained no cases".to_owned()));
        }
        Ok(suite)
    }

    fn read_coverage(
        &self,
        target: &Target,
        coverage_file: &Path,
    ) -> Result<TestCoverage, BuildError> {
        let bad = |reason: String| BuildError::TestError {
            label: target.label.clone(),
            reason,
        };
        let content = std::fs::read_to_string(coverage_file)
            .map_err(|e| bad(format!("cannot read coverage: {e}")))?;
        let parsed: CoverageJson =
            serde_json_lenient::from_str(&content).map_err(|e| bad(format!("bad coverage: {e}")))?;

        let mut coverage = TestCoverage::default();
        for (file, encoded) in parsed.files {
            let mut lines = Vec::with_capacity(encoded.len());
            for c in encoded.chars() {
                let line = LineCoverage::from_char(c)
                    .ok_or_else(|| bad(format!("bad coverage marker `{c}` for {file}")))?;
                lines.push(line);
            }
            coverage.files.insert(file, lines);
        }
        Ok(coverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantryutil::label::BuildLabel;

    fn write(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.results");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_json_lines() {
        let (_dir, path) = write(concat!(
            "{\"name\": \"adds\", \"status\": \"pass\", \"duration_ms\": 3}\n",
            "{\"name\": \"subtracts\", \"status\": \"fail\", \"message\": \"1 != 2\"}\n",
            "{\"name\": \"skips\", \"status\": \"skip\", \"message\": \"linux only\"}\n",
        ));
        let target = Target::new(BuildLabel::new("a", "t"));
        let suite = JsonResultReader::new().read_results(&target, &path).unwrap();
        assert_eq!(suite.tests(), 3);
        assert_eq!(suite.passes(), 1);
        assert_eq!(suite.failures(), 1);
        assert_eq!(suite.skips(), 1);
    }

    #[test]
    fn unparseable_results_are_an_error() {
        let (_dir, path) = write("not json at all\n");
        let target = Target::new(BuildLabel::new("a", "t"));
        assert!(
            JsonResultReader::new()
                .read_results(&target, &path)
                .is_err()
        );

        let (_dir, path) = write("");
        assert!(
            JsonResultReader::new()
                .read_results(&target, &path)
                .is_err()
        );
    }

    #[test]
    fn reads_coverage_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.coverage");
        std::fs::write(&path, r#"{"files": {"src/a.c": "NCUC"}}"#).unwrap();
        let target = Target::new(BuildLabel::new("a", "t"));
        let coverage = JsonResultReader::new().read_coverage(&target, &path).unwrap();
        assert_eq!(
            coverage.files["src/a.c"],
            vec![
                LineCoverage::NotExecutable,
                LineCoverage::Covered,
                LineCoverage::Uncovered,
                LineCoverage::Covered
            ]
        );
    }
}
