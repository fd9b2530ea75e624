//! Name normalization
//!
//! Triplet grouping keys are cloud-normalized names: Unicode NFC, case
//! folded when the sync's filesystem is case-insensitive. Two siblings whose
//! keys collide are a name conflict, not two rows.

use unicode_normalization::UnicodeNormalization;

pub fn normalized_key(name: &str, case_insensitive: bool) -> String {
    let nfc: String = name.nfc().collect();
    if case_insensitive {
        nfc.to_lowercase()
    } else {
        nfc
    }
}

pub fn names_equal(a: &str, b: &str, case_insensitive: bool) -> bool {
    normalized_key(a, case_insensitive) == normalized_key(b, case_insensitive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nfc_unifies_composed_and_decomposed() {
        // U+00E9 vs e + U+0301
        assert!(names_equal("caf\u{e9}", "cafe\u{301}", false));
    }

    #[test]
    fn case_fold_only_when_insensitive() {
        assert!(names_equal("Readme", "readme", true));
        assert!(!names_equal("Readme", "readme", false));
    }
}
