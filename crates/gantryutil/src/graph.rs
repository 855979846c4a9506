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

use std::hash::Hash;

use petgraph::prelude::DiGraphMap;

/// Find the path `to -> ... -> from` in `g`, if one exists.
///
/// Used when inserting the dependency edge `from -> to`: a path back from
/// `to` to `from` means the insertion would close a cycle, and the returned
/// path (plus the new edge) is the cycle to report.
pub fn path_between<N>(g: &DiGraphMap<N, ()>, to: N, from: N) -> Option<Vec<N>>
where
    N: Copy + Eq + Hash + Ord,
{
    if !g.contains_node(to) || !g.contains_node(from) {
        return None;
    }
    // the parent of each node in the spanning tree
    let mut spanning_tree: std::collections::HashMap<N, N> = std::collections::HashMap::new();
    let res = petgraph::visit::depth_first_search(g, [to], |ev| match ev {
        petgraph::visit::DfsEvent::TreeEdge(parent, n) => {
            spanning_tree.insert(n, parent);
            if n == from {
                petgraph::visit::Control::Break(n)
            } else {
                petgraph::visit::Control::Continue
            }
        }
        _ => petgraph::visit::Control::Continue,
    });
    res.break_value()?;
    let mut path = vec![from];
    let mut curr = from;
    while curr != to {
        curr = *spanning_tree.get(&curr)?;
        path.push(curr);
    }
    path.reverse();
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_back_path() {
        let mut g: DiGraphMap<u32, ()> = DiGraphMap::new();
        g.add_edge(1, 2, ());
        g.add_edge(2, 3, ());
        // Inserting 3 -> 1 would close the cycle 1 -> 2 -> 3 -> 1.
        let path = path_between(&g, 1, 3).unwrap();
        assert_eq!(path, vec![1, 2, 3]);
    }

    #[test]
    fn no_path_no_cycle() {
        let mut g: DiGraphMap<u32, ()> = DiGraphMap::new();
        g.add_edge(1, 2, ());
        g.add_edge(3, 2, ());
        assert!(path_between(&g, 2, 3).is_none());
    }
}
