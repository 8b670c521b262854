// Key matchers used by the regex and similarity scans.
use std::cmp::min;

use regex::bytes::Regex;

use crate::core::error::{Error, ErrorKind};

pub(crate) fn compile_pattern(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|err| {
        Error::new(ErrorKind::Logic)
            .with_message("invalid regular expression")
            .with_hint(format!("Check the pattern `{pattern}`."))
            .with_source(err)
    })
}

/// Levenshtein distance between two sequences.
pub(crate) fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, left) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, right) in b.iter().enumerate() {
            let substitute = diagonal + usize::from(left != right);
            diagonal = row[j + 1];
            row[j + 1] = min(substitute, min(row[j], diagonal) + 1);
        }
    }
    row[b.len()]
}

/// Distance between two keys, in bytes or in decoded characters.
pub(crate) fn key_distance(origin: &[u8], key: &[u8], utf: bool) -> usize {
    if utf {
        let origin = String::from_utf8_lossy(origin).chars().collect::<Vec<_>>();
        let key = String::from_utf8_lossy(key).chars().collect::<Vec<_>>();
        edit_distance(&origin, &key)
    } else {
        edit_distance(origin, key)
    }
}

#[cfg(test)]
mod tests {
    use super::{compile_pattern, edit_distance, key_distance};
    use crate::core::error::ErrorKind;

    #[test]
    fn distances() {
        assert_eq!(edit_distance(b"kitten", b"sitting"), 3);
        assert_eq!(edit_distance(b"", b"abc"), 3);
        assert_eq!(edit_distance(b"abc", b""), 3);
        assert_eq!(edit_distance(b"same", b"same"), 0);
        assert_eq!(edit_distance(b"flaw", b"lawn"), 2);
    }

    #[test]
    fn utf_mode_counts_characters() {
        let origin = "café".as_bytes();
        let key = "cafe".as_bytes();
        assert_eq!(key_distance(origin, key, false), 2);
        assert_eq!(key_distance(origin, key, true), 1);
    }

    #[test]
    fn bad_pattern_is_logic_error() {
        let err = compile_pattern("(unclosed").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Logic);
        assert!(compile_pattern("^user:[0-9]+$").is_ok());
    }
}
