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

//! Line coverage model and merging.
//!
//! Lines are 1-indexed at the source level but stored 0-indexed here.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Coverage state of a single line. The numeric order is the merge
/// priority: `Covered > Uncovered > Unreachable > NotExecutable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum LineCoverage {
    NotExecutable = 0,
    Unreachable = 1,
    Uncovered = 2,
    Covered = 3,
}

impl LineCoverage {
    /// Single-character encoding used in the aggregated coverage file.
    pub fn as_char(self) -> char {
        match self {
            LineCoverage::NotExecutable => 'N',
            LineCoverage::Unreachable => 'X',
            LineCoverage::Uncovered => 'U',
            LineCoverage::Covered => 'C',
        }
    }

    pub fn from_char(c: char) -> Option<LineCoverage> {
        match c {
            'N' => Some(LineCoverage::NotExecutable),
            'X' => Some(LineCoverage::Unreachable),
            'U' => Some(LineCoverage::Uncovered),
            'C' => Some(LineCoverage::Covered),
            _ => None,
        }
    }
}

/// Coverage of one target's run: file -> per-line states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCoverage {
    pub files: IndexMap<String, Vec<LineCoverage>>,
}

impl TestCoverage {
    /// Merge another run's coverage into this one, line by line, taking the
    /// higher-priority state. Missing lines count as `NotExecutable`, so the
    /// merge is commutative and associative.
    pub fn merge(&mut self, other: &TestCoverage) {
        for (file, lines) in &other.files {
            let entry = self.files.entry(file.clone()).or_default();
            if entry.len() < lines.len() {
                entry.resize(lines.len(), LineCoverage::NotExecutable);
            }
            for (i, line) in lines.iter().enumerate() {
                entry[i] = (*line).max(entry[i]);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Covered / (covered + uncovered) for one file, as a percentage.
    /// `None` when the file has no executable lines at all.
    pub fn file_percentage(lines: &[LineCoverage]) -> Option<f64> {
        let covered = lines
            .iter()
            .filter(|&&l| l == LineCoverage::Covered)
            .count();
        let uncovered = lines
            .iter()
            .filter(|&&l| l == LineCoverage::Uncovered)
            .count();
        if covered + uncovered == 0 {
            None
        } else {
            Some(covered as f64 / (covered + uncovered) as f64 * 100.0)
        }
    }
}

/// Invocation-wide coverage aggregate, as persisted to
/// `plz-out/log/coverage.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// file -> encoded line states (see [`LineCoverage::as_char`]).
    pub files: IndexMap<String, String>,
    /// file -> covered percentage.
    pub percentages: IndexMap<String, f64>,
    /// directory -> covered percentage across its files.
    pub directories: IndexMap<String, f64>,
    pub total_percentage: Option<f64>,
}

impl CoverageSummary {
    pub fn from_coverage(coverage: &TestCoverage) -> Self {
        let mut summary = CoverageSummary::default();
        let mut dir_counts: IndexMap<String, (usize, usize)> = IndexMap::new();
        let mut total_covered = 0usize;
        let mut total_uncovered = 0usize;

        for (file, lines) in &coverage.files {
            summary.files.insert(
                file.clone(),
                lines.iter().map(|l| l.as_char()).collect::<String>(),
            );
            if let Some(pct) = TestCoverage::file_percentage(lines) {
                summary.percentages.insert(file.clone(), pct);
            }
            let covered = lines
                .iter()
                .filter(|&&l| l == LineCoverage::Covered)
                .count();
            let uncovered = lines
                .iter()
                .filter(|&&l| l == LineCoverage::Uncovered)
                .count();
            total_covered += covered;
            total_uncovered += uncovered;

            let dir = match file.rsplit_once('/') {
                Some((dir, _)) => dir.to_owned(),
                None => String::new(),
            };
            let entry = dir_counts.entry(dir).or_insert((0, 0));
            entry.0 += covered;
            entry.1 += uncovered;
        }

        for (dir, (covered, uncovered)) in dir_counts {
            if covered + uncovered > 0 {
                summary
                    .directories
                    .insert(dir, covered as f64 / (covered + uncovered) as f64 * 100.0);
            }
        }
        if total_covered + total_uncovered > 0 {
            summary.total_percentage =
                Some(total_covered as f64 / (total_covered + total_uncovered) as f64 * 100.0);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cov(file: &str, lines: &[LineCoverage]) -> TestCoverage {
        let mut c = TestCoverage::default();
        c.files.insert(file.to_owned(), lines.to_vec());
        c
    }

    use LineCoverage::*;

    #[test]
    fn merge_takes_maximum() {
        let mut a = cov("f.go", &[NotExecutable, Uncovered, Covered]);
        let b = cov("f.go", &[Unreachable, Covered, Uncovered, Uncovered]);
        a.merge(&b);
        assert_eq!(
            a.files["f.go"],
            vec![Unreachable, Covered, Covered, Uncovered]
        );
    }

    #[test]
    fn merge_is_associative_and_commutative() {
        let a = cov("f", &[Covered, NotExecutable, Uncovered]);
        let b = cov("f", &[Uncovered, Unreachable]);
        let c = cov("f", &[NotExecutable, Covered, NotExecutable, Uncovered]);

        // merge(a, merge(b, c))
        let mut bc = b.clone();
        bc.merge(&c);
        let mut left = a.clone();
        left.merge(&bc);

        // merge(merge(a, b), c)
        let mut ab = a.clone();
        ab.merge(&b);
        let mut right = ab;
        right.merge(&c);

        assert_eq!(left, right);

        let mut forward = a.clone();
        forward.merge(&b);
        let mut backward = b.clone();
        backward.merge(&a);
        assert_eq!(forward, backward);
    }

    #[test]
    fn summary_percentages() {
        let mut c = cov("pkg/f.go", &[Covered, Uncovered, NotExecutable]);
        c.files
            .insert("pkg/g.go".to_owned(), vec![Covered, Covered]);
        let summary = CoverageSummary::from_coverage(&c);
        assert_eq!(summary.files["pkg/f.go"], "CUN");
        assert_eq!(summary.percentages["pkg/f.go"], 50.0);
        assert_eq!(summary.percentages["pkg/g.go"], 100.0);
        assert_eq!(summary.directories["pkg"], 75.0);
        assert_eq!(summary.total_percentage, Some(75.0));
    }
}
