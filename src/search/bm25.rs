use std::collections::HashMap;

/// Term frequency saturation.
pub const K1: f64 = 1.5;
/// Length normalization.
pub const B: f64 = 0.75;

/// BM25 relevance scorer over fixed corpus statistics.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Scorer {
    avg_doc_length: f64,
    total_docs: i64,
}

impl Bm25Scorer {
    #[must_use]
    pub fn new(avg_doc_length: f64, total_docs: i64) -> Self {
        Self {
            avg_doc_length,
            total_docs,
        }
    }

    /// Score one document against the query terms. Terms absent from the
    /// document or from the corpus contribute nothing; the idf of very
    /// common terms may be negative.
    #[must_use]
    pub fn score(
        &self,
        query_terms: &[String],
        term_freqs: &HashMap<String, i64>,
        doc_length: i64,
        doc_freqs: &HashMap<String, i64>,
    ) -> f64 {
        let mut score = 0.0;

        for term in query_terms {
            let tf = term_freqs.get(term).copied().unwrap_or(0) as f64;
            if tf == 0.0 {
                continue;
            }
            let df = doc_freqs.get(term).copied().unwrap_or(0) as f64;
            if df == 0.0 {
                continue;
            }

            let idf = ((self.total_docs as f64 - df + 0.5) / (df + 0.5)).ln();
            let tf_norm = (tf * (K1 + 1.0))
                / (tf + K1 * (1.0 - B + B * doc_length as f64 / self.avg_doc_length));

            score += idf * tf_norm;
        }

        score
    }
}

/// Lowercase alphanumeric tokenization, shared by indexing and querying.
/// Emits maximal runs of Unicode letters or digits; tokens of byte length 1
/// are dropped, which implicitly removes the shortest stopwords.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            current.push(ch);
        } else if !current.is_empty() {
            if current.len() > 1 {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() > 1 {
        tokens.push(current);
    }

    tokens
}

/// Count occurrences of each token.
#[must_use]
pub fn term_frequency(tokens: &[String]) -> HashMap<String, i64> {
    let mut freqs = HashMap::new();
    for token in tokens {
        *freqs.entry(token.clone()).or_insert(0) += 1;
    }
    freqs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_lowercases_and_drops_single_letters() {
        let tokens = tokenize("Hello, HELLO! numbers123 stay; x y z.");
        assert_eq!(tokens, vec!["hello", "hello", "numbers123", "stay"]);
    }

    #[test]
    fn tokenize_handles_empty_and_symbol_only_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("!!! -- ??").is_empty());
    }

    #[test]
    fn tokenize_keeps_unicode_letter_runs_together() {
        assert_eq!(tokenize("Grüße an café-Besucher"), vec!["grüße", "an", "café", "besucher"]);
    }

    #[test]
    fn term_frequency_counts_the_multiset() {
        let freqs = term_frequency(&tokenize("Hello, HELLO! numbers123 stay; x y z."));
        assert_eq!(freqs.get("hello"), Some(&2));
        assert_eq!(freqs.get("numbers123"), Some(&1));
        assert!(!freqs.contains_key("x"));
    }

    #[test]
    fn bm25_matches_hand_computed_score() {
        let scorer = Bm25Scorer::new(100.0, 10);
        let term_freqs = HashMap::from([("gopher".to_string(), 2)]);
        let doc_freqs = HashMap::from([("gopher".to_string(), 1)]);
        let score = scorer.score(&["gopher".to_string()], &term_freqs, 120, &doc_freqs);

        let idf = ((10.0 - 1.0 + 0.5_f64) / (1.0 + 0.5)).ln();
        let tf_norm = (2.0 * (K1 + 1.0)) / (2.0 + K1 * (1.0 - B + B * 120.0 / 100.0));
        let want = idf * tf_norm;

        assert!((score - want).abs() < 1e-9, "score {score} != {want}");
        assert!(score > 0.0);
    }

    #[test]
    fn bm25_is_zero_when_no_query_term_is_in_the_corpus() {
        let scorer = Bm25Scorer::new(50.0, 4);
        let term_freqs = HashMap::from([("missing".to_string(), 3)]);
        let score = scorer.score(
            &["missing".to_string()],
            &term_freqs,
            50,
            &HashMap::new(),
        );
        assert_eq!(score, 0.0);
    }

    #[test]
    fn bm25_idf_goes_negative_for_terms_in_most_documents() {
        let scorer = Bm25Scorer::new(10.0, 10);
        let term_freqs = HashMap::from([("the".to_string(), 1)]);
        let doc_freqs = HashMap::from([("the".to_string(), 10)]);
        let score = scorer.score(&["the".to_string()], &term_freqs, 10, &doc_freqs);
        assert!(score < 0.0, "common-term score should be negative: {score}");
    }
}
