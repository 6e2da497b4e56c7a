//! Trigram similarity, compatible with PostgreSQL `pg_trgm`.
//!
//! Text is lower-cased and split into words on non-alphanumeric
//! characters. Each word is padded with two leading spaces and one
//! trailing space, and its three-character windows form the trigram set.
//! Similarity is `|A ∩ B| / |A ∪ B|` over the two sets.

use std::collections::HashSet;

pub fn trigrams(text: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars().flat_map(char::to_lowercase))
            .chain(std::iter::once(' '))
            .collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

/// Similarity in `[0, 1]`; `0.0` when either side has no trigrams.
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.len() + tb.len() - shared;
    shared as f64 / union as f64
}

/// Best similarity of `query` against any of `fields`.
pub fn max_similarity<'a>(query: &str, fields: impl IntoIterator<Item = &'a str>) -> f64 {
    let tq = trigrams(query);
    if tq.is_empty() {
        return 0.0;
    }
    fields
        .into_iter()
        .map(|field| {
            let tf = trigrams(field);
            if tf.is_empty() {
                return 0.0;
            }
            let shared = tq.intersection(&tf).count();
            shared as f64 / (tq.len() + tf.len() - shared) as f64
        })
        .fold(0.0, f64::max)
}
