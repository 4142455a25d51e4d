//! Store path fundamentals shared by the substituter and the differ:
//! the nix base32 codec, store path parsing, and the string helpers the
//! base-selection heuristic is built on.

pub mod base32;
pub mod store_path;

pub use store_path::{StoreName, StorePath, StorePathError};

/// Absolute path of the store directory.
pub const STORE_DIR: &str = "/nix/store";

/// Length of the base32-encoded hash prefix of a store name.
pub const STORE_HASH_LEN: usize = 32;

/// Positions of `-` bytes in `s`, in order.
pub fn find_dashes(s: &str) -> Vec<usize> {
    s.bytes()
        .enumerate()
        .filter(|&(_, b)| b == b'-')
        .map(|(i, _)| i)
        .collect()
}

/// Length of the common byte prefix of `a` and `b`.
pub fn match_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_dashes() {
        for (s, expected) in [
            ("", vec![]),
            ("eeeeeeeee", vec![]),
            ("asdf-eeeeee", vec![4]),
            ("asdf--eeeee", vec![4, 5]),
            ("-tttttt", vec![0]),
            ("---oooooo", vec![0, 1, 2]),
            ("qqqqqq-", vec![6]),
            ("qqqqqq--", vec![6, 7]),
            ("qqqqqq---", vec![6, 7, 8]),
            ("-a-b--cdef-", vec![0, 2, 4, 5, 10]),
        ] {
            assert_eq!(find_dashes(s), expected, "input {s:?}");
        }
    }

    #[test]
    fn test_match_len() {
        for (a, b, expected) in [
            ("", "", 0),
            ("a", "", 0),
            ("", "b", 0),
            ("b", "b", 1),
            ("bcccc", "b", 1),
            ("bcccc", "bcc", 3),
            ("uiopuiop", "uiopuiop", 8),
            ("uiOpuiop", "uiopuiop", 2),
        ] {
            assert_eq!(match_len(a, b), expected, "inputs {a:?} {b:?}");
        }
    }
}
