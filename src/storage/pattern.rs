//! SQL `LIKE` matching for field queries.

use lru::LruCache;
use regex::{Regex, RegexBuilder};
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::core::{PersistError, Result};

const PATTERN_CACHE_CAPACITY: usize = 200;

/// Converts a LIKE pattern to an anchored regex.
/// `%` matches any run, `_` one character, `\` escapes the next character.
fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => regex.push_str(&regex::escape(&escaped.to_string())),
                None => regex.push_str(&regex::escape("\\")),
            },
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }

    regex.push('$');
    regex
}

/// Answers the common shapes without building a regex.
fn fast_path_like(text: &str, pattern: &str, case_sensitive: bool) -> Option<bool> {
    if pattern.contains('_') || pattern.contains('\\') {
        return None;
    }
    let (text, pattern) = if case_sensitive {
        (text.to_string(), pattern.to_string())
    } else {
        (text.to_lowercase(), pattern.to_lowercase())
    };

    match pattern.matches('%').count() {
        0 => Some(text == pattern),
        1 if pattern.ends_with('%') => Some(text.starts_with(&pattern[..pattern.len() - 1])),
        1 if pattern.starts_with('%') => Some(text.ends_with(&pattern[1..])),
        2 if pattern.len() >= 2 && pattern.starts_with('%') && pattern.ends_with('%') => {
            Some(text.contains(&pattern[1..pattern.len() - 1]))
        }
        _ => None,
    }
}

/// Compiled LIKE patterns, owned by one store.
#[derive(Debug)]
pub struct PatternCache {
    compiled: RefCell<LruCache<String, Arc<Regex>>>,
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new(PATTERN_CACHE_CAPACITY)
    }
}

impl PatternCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            compiled: RefCell::new(LruCache::new(capacity)),
        }
    }

    fn regex(&self, pattern: &str, case_sensitive: bool) -> Result<Arc<Regex>> {
        let cache_key = if case_sensitive {
            format!("s:{}", pattern)
        } else {
            format!("i:{}", pattern)
        };

        if let Some(regex) = self.compiled.borrow_mut().get(&cache_key) {
            return Ok(Arc::clone(regex));
        }

        let compiled = RegexBuilder::new(&like_to_regex(pattern))
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| PersistError::UnsupportedQuery(format!("invalid LIKE pattern: {}", e)))?;
        let compiled = Arc::new(compiled);
        self.compiled
            .borrow_mut()
            .put(cache_key, Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn is_match(&self, text: &str, pattern: &str, case_sensitive: bool) -> Result<bool> {
        if let Some(result) = fast_path_like(text, pattern, case_sensitive) {
            return Ok(result);
        }
        Ok(self.regex(pattern, case_sensitive)?.is_match(text))
    }

    pub fn len(&self) -> usize {
        self.compiled.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_paths() {
        let cache = PatternCache::default();
        assert!(cache.is_match("INV-001", "INV%", true).unwrap());
        assert!(cache.is_match("INV-001", "%001", true).unwrap());
        assert!(cache.is_match("INV-001", "%V-0%", true).unwrap());
        assert!(cache.is_match("inv-001", "INV-001", false).unwrap());
        assert!(!cache.is_match("inv-001", "INV-001", true).unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_regex_path_and_cache() {
        let cache = PatternCache::default();
        assert!(cache.is_match("INV-001", "INV-_0%", true).unwrap());
        assert!(!cache.is_match("INV-1", "INV-_0%", true).unwrap());
        assert!(cache.is_match("a.b", "a._", true).unwrap());
        assert!(!cache.is_match("axb", "a\\_b", true).unwrap());
        assert!(cache.is_match("a_b", "a\\_b", true).unwrap());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let cache = PatternCache::default();
        assert!(cache.is_match("(1+1)", "(1+_)", true).unwrap());
        assert!(!cache.is_match("11", "(1+_)", true).unwrap());
    }
}
