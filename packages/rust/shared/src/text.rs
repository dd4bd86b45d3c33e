//! Name canonicalization and comparison shared by registry and roster
//! processing.

use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Canonicalize a person name for comparison.
///
/// Strips diacritics (NFKD + combining-mark removal), upper-cases, trims and
/// collapses internal whitespace. `"  José  da Silva "` becomes `"JOSE DA SILVA"`.
pub fn normalize_name(raw: &str) -> String {
    let stripped: String = raw.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    stripped
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token-set similarity of two normalized names, in `[0, 1]`.
///
/// Tokens shared by both names are compared as one sorted string against
/// each name's sorted tokens, so word order and extra middle names do not
/// lower the score; a name whose tokens are all contained in the other
/// scores `1.0`. String comparison is normalized Levenshtein.
pub fn token_set_similarity(a: &str, b: &str) -> f64 {
    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared = join(left.intersection(&right));
    let only_left = join(left.difference(&right));
    let only_right = join(right.difference(&left));
    if !shared.is_empty() && (only_left.is_empty() || only_right.is_empty()) {
        return 1.0;
    }

    let with_left = concat(&shared, &only_left);
    let with_right = concat(&shared, &only_right);
    let mut best = strsim::normalized_levenshtein(&with_left, &with_right);
    if !shared.is_empty() {
        best = best
            .max(strsim::normalized_levenshtein(&shared, &with_left))
            .max(strsim::normalized_levenshtein(&shared, &with_right));
    }
    best
}

fn join<'a, 'b: 'a>(tokens: impl Iterator<Item = &'a &'b str>) -> String {
    tokens.copied().collect::<Vec<_>>().join(" ")
}

fn concat(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{head} {tail}"),
    }
}
