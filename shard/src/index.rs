//! Volatile ordered key index.

use std::collections::BTreeSet;

use kvapi::{FindType, KvIndex, Result, Status};

/// Ordered set of keys kept beside a pool, rebuildable from the backend by
/// enumerating keys.
///
/// Pattern matches (`FindType::Regex`) use a wildcard grammar: `*` matches
/// any run of bytes, `?` matches one byte, anything else is literal.
#[derive(Default)]
pub struct VolatileTreeIndex {
    keys: BTreeSet<Vec<u8>>,
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    // Iterative backtracking over the single `*` resume point.
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = p;
            mark = t;
            p += 1;
        } else if star != usize::MAX {
            p = star + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

impl VolatileTreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(expr: &str, find_type: FindType, key: &[u8]) -> bool {
        match find_type {
            FindType::Exact => key == expr.as_bytes(),
            FindType::Prefix => key.starts_with(expr.as_bytes()),
            FindType::Regex => wildcard_match(expr.as_bytes(), key),
            FindType::Next => true,
        }
    }
}

impl KvIndex for VolatileTreeIndex {
    fn insert(&mut self, key: &[u8]) {
        self.keys.insert(key.to_vec());
    }

    fn remove(&mut self, key: &[u8]) {
        self.keys.remove(key);
    }

    fn count(&self) -> u64 {
        self.keys.len() as u64
    }

    fn find(
        &self,
        expr: &str,
        begin: u64,
        find_type: FindType,
        max_comparisons: u64,
    ) -> Result<(u64, Vec<u8>)> {
        let mut compared = 0u64;
        for (pos, key) in self.keys.iter().enumerate().skip(begin as usize) {
            if compared >= max_comparisons {
                // Budget exhausted; caller resumes from this position.
                return Err(Status::More);
            }
            compared += 1;
            if Self::matches(expr, find_type, key) {
                return Ok((pos as u64, key.clone()));
            }
        }
        Err(Status::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(keys: &[&str]) -> VolatileTreeIndex {
        let mut idx = VolatileTreeIndex::new();
        for k in keys {
            idx.insert(k.as_bytes());
        }
        idx
    }

    #[test]
    fn test_exact_and_prefix() {
        let idx = index(&["aaa", "abc", "abd", "zzz"]);
        assert_eq!(idx.count(), 4);

        let (pos, key) = idx.find("abc", 0, FindType::Exact, 100).unwrap();
        assert_eq!((pos, key.as_slice()), (1, b"abc".as_slice()));

        let (pos, key) = idx.find("ab", 0, FindType::Prefix, 100).unwrap();
        assert_eq!((pos, key.as_slice()), (1, b"abc".as_slice()));

        // Resume past the first match.
        let (pos, key) = idx.find("ab", pos + 1, FindType::Prefix, 100).unwrap();
        assert_eq!((pos, key.as_slice()), (2, b"abd".as_slice()));

        assert_eq!(idx.find("ab", pos + 1, FindType::Prefix, 100), Err(Status::Fail));
    }

    #[test]
    fn test_budget_exhaustion() {
        let idx = index(&["a0", "a1", "a2", "a3", "b0"]);
        assert_eq!(idx.find("b0", 0, FindType::Exact, 2), Err(Status::More));
        let (pos, _) = idx.find("b0", 2, FindType::Exact, 100).unwrap();
        assert_eq!(pos, 4);
    }

    #[test]
    fn test_wildcard() {
        assert!(wildcard_match(b"a*c", b"abbbc"));
        assert!(wildcard_match(b"a*c", b"ac"));
        assert!(wildcard_match(b"a?c", b"abc"));
        assert!(!wildcard_match(b"a?c", b"ac"));
        assert!(wildcard_match(b"*", b"anything"));
        assert!(!wildcard_match(b"a*b", b"acd"));

        let idx = index(&["user_1", "user_2", "widget_9"]);
        let (_, key) = idx.find("user_*", 0, FindType::Regex, 100).unwrap();
        assert_eq!(key, b"user_1");
        let (_, key) = idx.find("w*_9", 0, FindType::Regex, 100).unwrap();
        assert_eq!(key, b"widget_9");
    }

    #[test]
    fn test_next_and_remove() {
        let mut idx = index(&["a", "b", "c"]);
        let (pos, key) = idx.find("", 1, FindType::Next, 100).unwrap();
        assert_eq!((pos, key.as_slice()), (1, b"b".as_slice()));

        idx.remove(b"b");
        let (pos, key) = idx.find("", 1, FindType::Next, 100).unwrap();
        assert_eq!((pos, key.as_slice()), (1, b"c".as_slice()));
    }
}
