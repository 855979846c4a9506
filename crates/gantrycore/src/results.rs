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

//! Test result model: suites of cases, cases of executions.
//!
//! Flakiness is modeled as multiple executions on one case; the collation
//! rule lives in [`TestCase::success`].

use std::path::Path;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::BuildError;
use crate::target::Target;

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// What kind of synthetic or parsed problem an execution carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The test exited zero but produced no results file.
    MissingResults,
    /// No parseable results were produced.
    NoResults,
    /// The test binary reported a failure.
    TestFailed,
    /// Exit status disagreed with the parsed results.
    ReturnValue,
    /// Free-form kind from a results parser.
    Other(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::MissingResults => write!(f, "MissingResults"),
            FailureKind::NoResults => write!(f, "NoResults"),
            FailureKind::TestFailed => write!(f, "TestFailed"),
            FailureKind::ReturnValue => write!(f, "ReturnValue"),
            FailureKind::Other(s) => write!(f, "{s}"),
        }
    }
}

/// One run of one test case: exactly one of success, skip, failure or error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOutcome {
    Success {
        #[serde(with = "opt_duration_ms")]
        duration: Option<Duration>,
    },
    Skipped {
        message: String,
    },
    Failure {
        kind: FailureKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    Error {
        kind: FailureKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestExecution {
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl TestExecution {
    pub fn success(duration: Option<Duration>) -> Self {
        TestExecution {
            outcome: TestOutcome::Success { duration },
            stdout: None,
            stderr: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TestOutcome::Success { .. })
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.outcome, TestOutcome::Skipped { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, TestOutcome::Failure { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, TestOutcome::Error { .. })
    }
}

/// A named test case with its ordered executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub executions: Vec<TestExecution>,
}

impl TestCase {
    pub fn new(name: impl Into<String>) -> Self {
        TestCase {
            name: name.into(),
            executions: Vec::new(),
        }
    }

    /// The execution that makes this case count as successful, if any.
    ///
    /// A case is successful iff at least one execution succeeded and no
    /// failure or error came after the last success: `[fail, fail, pass]`
    /// is a flaky pass, `[pass, fail]` is a fail.
    pub fn success(&self) -> Option<&TestExecution> {
        let last_good = self.executions.iter().rposition(|e| e.is_success())?;
        let last_bad = self
            .executions
            .iter()
            .rposition(|e| e.is_failure() || e.is_error());
        match last_bad {
            Some(bad) if bad > last_good => None,
            _ => Some(&self.executions[last_good]),
        }
    }

    /// Successful, but needed more than one attempt.
    pub fn is_flaky(&self) -> bool {
        self.success().is_some()
            && self
                .executions
                .iter()
                .any(|e| e.is_failure() || e.is_error())
    }

    pub fn is_skipped(&self) -> bool {
        !self.executions.is_empty() && self.executions.iter().all(|e| e.is_skip())
    }

    pub fn has_error(&self) -> bool {
        self.success().is_none() && self.executions.iter().any(|e| e.is_error())
    }

    pub fn has_failure(&self) -> bool {
        self.success().is_none() && !self.has_error() && self.executions.iter().any(|e| e.is_failure())
    }
}

/// All results of one target's tests for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub package: String,
    pub name: String,
    /// When the suite started, RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(with = "duration_ms", default)]
    pub duration: Duration,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, String>,
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        TestSuite {
            package: package.into(),
            name: name.into(),
            timestamp: Some(chrono::Local::now().to_rfc3339()),
            duration: Duration::ZERO,
            cached: false,
            properties: IndexMap::new(),
            cases: Vec::new(),
        }
    }

    /// Fold another run of the same suite into this one: executions of a
    /// case seen before are appended to it, new cases are added.
    pub fn collapse(&mut self, other: TestSuite) {
        self.duration += other.duration;
        for case in other.cases {
            match self.cases.iter_mut().find(|c| c.name == case.name) {
                Some(existing) => existing.executions.extend(case.executions),
                None => self.cases.push(case),
            }
        }
        for (k, v) in other.properties {
            self.properties.entry(k).or_insert(v);
        }
    }

    pub fn add_case(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    pub fn tests(&self) -> usize {
        self.cases.len()
    }

    pub fn passes(&self) -> usize {
        self.cases
            .iter()
            .filter(|c| c.success().is_some() && !c.is_skipped())
            .count()
    }

    pub fn failures(&self) -> usize {
        self.cases.iter().filter(|c| c.has_failure()).count()
    }

    pub fn errors(&self) -> usize {
        self.cases.iter().filter(|c| c.has_error()).count()
    }

    pub fn skips(&self) -> usize {
        self.cases.iter().filter(|c| c.is_skipped()).count()
    }

    pub fn flakes(&self) -> usize {
        self.cases.iter().filter(|c| c.is_flaky()).count()
    }

    /// True when every case collated successfully (or was skipped).
    pub fn all_succeeded(&self) -> bool {
        self.failures() == 0 && self.errors() == 0
    }
}

/// Reads executor output files back into the result model. The concrete
/// formats (JUnit, gcov, istanbul, ...) are opaque post-processors behind
/// this seam.
pub trait ResultReader: Send + Sync {
    /// Parse the `test.results` file found in the test directory.
    /// `Err` means the file existed but could not be understood.
    fn read_results(&self, target: &Target, results_file: &Path) -> Result<TestSuite, BuildError>;

    /// Parse the `test.coverage` file found in the test directory.
    fn read_coverage(
        &self,
        target: &Target,
        coverage_file: &Path,
    ) -> Result<crate::coverage::TestCoverage, BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail() -> TestExecution {
        TestExecution {
            outcome: TestOutcome::Failure {
                kind: FailureKind::TestFailed,
                message: "assertion failed".to_owned(),
                traceback: None,
            },
            stdout: None,
            stderr: None,
        }
    }

    fn pass() -> TestExecution {
        TestExecution::success(Some(Duration::from_millis(10)))
    }

    #[test]
    fn flaky_pass_collates_successful() {
        let mut case = TestCase::new("t");
        case.executions = vec![fail(), fail(), pass()];
        assert!(case.success().is_some());
        assert!(case.is_flaky());
    }

    #[test]
    fn exhausted_retries_collate_failed() {
        let mut case = TestCase::new("t");
        case.executions = vec![fail(), fail()];
        assert!(case.success().is_none());
        assert!(case.has_failure());
    }

    #[test]
    fn later_run_failure_wins() {
        let mut case = TestCase::new("t");
        case.executions = vec![pass(), fail()];
        assert!(case.success().is_none());
    }

    #[test]
    fn collapse_merges_cases_by_name() {
        let mut a = TestSuite::new("pkg", "suite");
        let mut c1 = TestCase::new("t1");
        c1.executions.push(fail());
        a.add_case(c1);

        let mut b = TestSuite::new("pkg", "suite");
        let mut c1b = TestCase::new("t1");
        c1b.executions.push(pass());
        let mut c2 = TestCase::new("t2");
        c2.executions.push(pass());
        b.add_case(c1b);
        b.add_case(c2);

        a.collapse(b);
        assert_eq!(a.tests(), 2);
        assert_eq!(a.cases[0].executions.len(), 2);
        assert!(a.all_succeeded());
        assert_eq!(a.flakes(), 1);
    }

    #[test]
    fn suite_roundtrips_through_json() {
        let mut suite = TestSuite::new("pkg", "suite");
        let mut case = TestCase::new("t");
        case.executions.push(pass());
        case.executions.push(TestExecution {
            outcome: TestOutcome::Skipped {
                message: "not on this platform".to_owned(),
            },
            stdout: Some("out".to_owned()),
            stderr: None,
        });
        suite.add_case(case);

        let json = serde_json::to_string(&suite).unwrap();
        let back: TestSuite = serde_json::from_str(&json).unwrap();
        assert_eq!(suite, back);
    }
}
