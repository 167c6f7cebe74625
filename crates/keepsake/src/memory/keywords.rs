//! Keyword tokenization shared by scoring, retrieval and tier classification

use std::collections::HashSet;

const TRIM_CHARS: &[char] = &['.', ',', '!', '?', ';', ':', '"', '\'', '(', ')', '[', ']'];

/// Lowercased tokens longer than two characters with surrounding punctuation stripped
pub fn keyword_tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(TRIM_CHARS).to_lowercase())
        .filter(|token| token.chars().count() > 2)
        .collect()
}

/// Fraction of `query` tokens found in `candidate`, in [0, 1]
pub fn keyword_overlap(query: &HashSet<String>, candidate: &HashSet<String>) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let matched = query.intersection(candidate).count();
    matched as f32 / query.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_strip_punctuation_and_short_words() {
        let tokens = keyword_tokens("Hi, we did MATH today! ok?");
        assert!(tokens.contains("math"));
        assert!(tokens.contains("today"));
        assert!(tokens.contains("did"));
        assert!(!tokens.contains("hi"));
        assert!(!tokens.contains("we"));
        assert!(!tokens.contains("ok"));
    }

    #[test]
    fn overlap_is_fraction_of_query() {
        let query = keyword_tokens("math homework tonight");
        let candidate = keyword_tokens("finished the math homework");
        let overlap = keyword_overlap(&query, &candidate);
        assert!((overlap - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn empty_query_has_no_overlap() {
        let candidate = keyword_tokens("anything at all");
        assert_eq!(keyword_overlap(&HashSet::new(), &candidate), 0.0);
    }
}
