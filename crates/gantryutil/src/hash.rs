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

use std::hash::{Hash, Hasher};

use sha2::{Digest, Sha256};
use twox_hash::xxh3;

/// A 64-bit stable hash of the given data.
pub fn short_hash(data: impl Hash) -> u64 {
    let mut hasher = xxh3::Hash64::with_seed(0);
    data.hash(&mut hasher);
    hasher.finish()
}

/// A 16-character hexadecimal representation of the hash of the given data.
pub fn short_hash_str(data: impl Hash) -> String {
    format!("{:016x}", short_hash(data))
}

/// Collision-resistant hash over an ordered sequence of byte chunks, hex
/// encoded. Chunks are length-prefixed so that `["ab","c"]` and `["a","bc"]`
/// hash differently.
pub fn sha256_hex<I, C>(chunks: I) -> String
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for chunk in chunks {
        let bytes = chunk.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_boundaries_matter() {
        assert_ne!(sha256_hex(["ab", "c"]), sha256_hex(["a", "bc"]));
        assert_eq!(sha256_hex(["ab", "c"]), sha256_hex(["ab", "c"]));
    }

    #[test]
    fn short_hash_is_stable() {
        assert_eq!(short_hash_str("gantry"), short_hash_str("gantry"));
        assert_ne!(short_hash_str("gantry"), short_hash_str("gantrü"));
    }
}
