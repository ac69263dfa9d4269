/// Lexical side of the corpus index: word tokenizer and BM25 Okapi scoring.

use regex::Regex;
use std::collections::HashMap;

use crate::errors::GroundrankError;

/// Lowercasing word tokenizer (`\b\w+\b`), shared by corpus and queries.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    word: Regex,
}

impl Tokenizer {
    pub fn new() -> Result<Self, GroundrankError> {
        let word = Regex::new(r"\b\w+\b")
            .map_err(|e| GroundrankError::Internal(format!("Invalid tokenizer pattern: {}", e)))?;
        Ok(Tokenizer { word })
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        self.word
            .find_iter(&lower)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}

/// BM25 Okapi parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
    /// Terms with negative IDF are floored to `epsilon * mean IDF`.
    pub epsilon: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Bm25Params { k1: 1.5, b: 0.75, epsilon: 0.25 }
    }
}

/// In-memory BM25 index over pre-tokenized documents.
#[derive(Debug, Clone)]
pub struct Bm25Index {
    params: Bm25Params,
    term_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<usize>,
    avg_doc_len: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    pub fn build(docs: &[Vec<String>], params: Bm25Params) -> Self {
        let mut term_freqs = Vec::with_capacity(docs.len());
        let mut doc_lens = Vec::with_capacity(docs.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for tokens in docs {
            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token.clone()).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len();
            doc_lens.push(tokens.len());
            term_freqs.push(tf);
        }

        let n = docs.len() as f64;
        let avg_doc_len = if docs.is_empty() { 0.0 } else { total_len as f64 / n };

        let mut idf = HashMap::with_capacity(doc_freq.len());
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();
        for (term, df) in doc_freq {
            let df = df as f64;
            let value = (n - df + 0.5).ln() - (df + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(term.clone());
            }
            idf.insert(term, value);
        }
        if !idf.is_empty() {
            let floor = params.epsilon * (idf_sum / idf.len() as f64);
            for term in negative {
                idf.insert(term, floor);
            }
        }

        Bm25Index {
            params,
            term_freqs,
            doc_lens,
            avg_doc_len,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    /// Raw BM25 score of every document for the query tokens, in corpus order.
    ///
    /// Repeated query terms contribute once per occurrence.
    pub fn scores(&self, query: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.len()];
        if self.avg_doc_len == 0.0 {
            return scores;
        }
        let Bm25Params { k1, b, .. } = self.params;

        for term in query {
            let Some(&idf) = self.idf.get(term) else {
                continue;
            };
            for (i, tf) in self.term_freqs.iter().enumerate() {
                let Some(&freq) = tf.get(term) else {
                    continue;
                };
                let freq = freq as f64;
                let norm = 1.0 - b + b * self.doc_lens[i] as f64 / self.avg_doc_len;
                scores[i] += idf * (freq * (k1 + 1.0)) / (freq + k1 * norm);
            }
        }
        scores
    }
}
