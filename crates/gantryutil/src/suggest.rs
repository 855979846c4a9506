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

//! "Did you mean" suggestions for misspelled target names.

/// Maximum edit distance a candidate may have to be suggested.
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// At most this many candidates appear in one suggestion message.
const MAX_SUGGESTIONS: usize = 3;

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Rank `candidates` by edit distance to `needle`, keeping only close ones.
pub fn closest_matches<'a, T: AsRef<str>>(
    needle: &str,
    candidates: impl IntoIterator<Item = &'a T>,
) -> Vec<&'a str>
where
    T: 'a,
{
    let mut scored: Vec<(usize, &str)> = candidates
        .into_iter()
        .map(|c| (levenshtein(needle, c.as_ref()), c.as_ref()))
        .filter(|&(d, _)| d <= MAX_SUGGESTION_DISTANCE)
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored.truncate(MAX_SUGGESTIONS);
    scored.into_iter().map(|(_, c)| c).collect()
}

/// Build the suggestion suffix attached to a missing-target error.
///
/// Returns e.g. `Maybe you meant :x ?` or `Maybe you meant :x or :y ?`,
/// or `None` when nothing in the package is close enough.
pub fn suggest_targets<'a, T: AsRef<str>>(
    needle: &str,
    candidates: impl IntoIterator<Item = &'a T>,
) -> Option<String>
where
    T: 'a,
{
    let matches = closest_matches(needle, candidates);
    if matches.is_empty() {
        return None;
    }
    let mut msg = String::from("Maybe you meant ");
    for (i, m) in matches.iter().enumerate() {
        if i > 0 {
            msg.push_str(if i == matches.len() - 1 { " or " } else { ", " });
        }
        msg.push(':');
        msg.push_str(m);
    }
    msg.push_str(" ?");
    Some(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn distance() {
        assert_eq!(levenshtein("z", "x"), 1);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn single_suggestion() {
        let names = ["x".to_owned(), "unrelated_name".to_owned()];
        expect![[r#"
            Some(
                "Maybe you meant :x ?",
            )
        "#]]
        .assert_debug_eq(&suggest_targets("z", &names));
    }

    #[test]
    fn multiple_suggestions_are_ranked() {
        let names = [
            "libs".to_owned(),
            "lib".to_owned(),
            "liib".to_owned(),
            "completely_different".to_owned(),
        ];
        expect![[r#"
            Some(
                "Maybe you meant :lib, :liib or :libs ?",
            )
        "#]]
        .assert_debug_eq(&suggest_targets("lib", &names));
    }

    #[test]
    fn no_suggestion_when_too_far() {
        let names = ["alpha".to_owned(), "beta".to_owned()];
        assert_eq!(suggest_targets("zzzzzzzzzz", &names), None);
    }
}
