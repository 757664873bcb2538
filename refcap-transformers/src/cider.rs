//! CIDEr-D caption consensus metric.
//!
//! See "CIDEr: Consensus-based Image Description Evaluation" Vedantam et al. 2015
//! <https://arxiv.org/abs/1411.5726>. Document frequencies are computed over the references of
//! the evaluated corpus, so a score is only meaningful at corpus level. Lengths used by the
//! Gaussian penalty count bigrams, matching the coco-caption reference implementation.
use std::collections::{HashMap, HashSet};

const DEFAULT_N: usize = 4;
const DEFAULT_SIGMA: f64 = 6.0;

type Counts = HashMap<Vec<String>, usize>;

/// Lowercases and strips punctuation before splitting on whitespace.
pub fn tokenize(caption: &str) -> Vec<String> {
    caption
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

fn ngram_counts(words: &[String], n: usize) -> Counts {
    let mut counts = Counts::new();
    for k in 1..=n {
        for ngram in words.windows(k) {
            *counts.entry(ngram.to_vec()).or_default() += 1;
        }
    }
    counts
}

struct Vector {
    weights: Vec<HashMap<Vec<String>, f64>>,
    norms: Vec<f64>,
    length: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CiderScore {
    /// Mean over all evaluated samples.
    pub corpus: f64,
    pub per_sample: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cider {
    n: usize,
    sigma: f64,
}

impl Default for Cider {
    fn default() -> Self {
        Self {
            n: DEFAULT_N,
            sigma: DEFAULT_SIGMA,
        }
    }
}

impl Cider {
    pub fn new(n: usize, sigma: f64) -> Self {
        Self { n, sigma }
    }

    /// Scores each candidate against its references. `candidates[i]` is compared to
    /// `references[i]`; samples without references score 0.
    pub fn compute<S: AsRef<str>, R: AsRef<str>>(
        &self,
        candidates: &[S],
        references: &[Vec<R>],
    ) -> CiderScore {
        let n_samples = candidates.len().min(references.len());
        if n_samples == 0 {
            return CiderScore {
                corpus: 0.,
                per_sample: vec![],
            };
        }
        let candidates: Vec<Counts> = candidates[..n_samples]
            .iter()
            .map(|c| ngram_counts(&tokenize(c.as_ref()), self.n))
            .collect();
        let references: Vec<Vec<Counts>> = references[..n_samples]
            .iter()
            .map(|refs| {
                refs.iter()
                    .map(|r| ngram_counts(&tokenize(r.as_ref()), self.n))
                    .collect()
            })
            .collect();

        let mut document_frequency: HashMap<&Vec<String>, f64> = HashMap::new();
        for refs in references.iter() {
            let ngrams: HashSet<&Vec<String>> = refs.iter().flat_map(|r| r.keys()).collect();
            for ngram in ngrams {
                *document_frequency.entry(ngram).or_default() += 1.;
            }
        }
        let ref_len = (n_samples as f64).ln();

        let vectorize = |counts: &Counts| {
            let mut weights = vec![HashMap::new(); self.n];
            let mut norms = vec![0f64; self.n];
            let mut length = 0f64;
            for (ngram, &tf) in counts.iter() {
                let order = ngram.len() - 1;
                let df = document_frequency
                    .get(ngram)
                    .copied()
                    .unwrap_or(0.)
                    .max(1.)
                    .ln();
                let w = tf as f64 * (ref_len - df);
                norms[order] += w * w;
                weights[order].insert(ngram.clone(), w);
                if order == 1 {
                    length += tf as f64;
                }
            }
            let norms = norms.into_iter().map(f64::sqrt).collect();
            Vector {
                weights,
                norms,
                length,
            }
        };

        let per_sample: Vec<f64> = candidates
            .iter()
            .zip(references.iter())
            .map(|(candidate, refs)| {
                if refs.is_empty() {
                    return 0.;
                }
                let hyp = vectorize(candidate);
                let mut score = vec![0f64; self.n];
                for reference in refs.iter() {
                    let reference = vectorize(reference);
                    for (order, s) in self.similarity(&hyp, &reference).into_iter().enumerate() {
                        score[order] += s;
                    }
                }
                let mean = score.iter().sum::<f64>() / self.n as f64;
                mean / refs.len() as f64 * 10.
            })
            .collect();
        let corpus = per_sample.iter().sum::<f64>() / per_sample.len() as f64;
        CiderScore { corpus, per_sample }
    }

    fn similarity(&self, hyp: &Vector, reference: &Vector) -> Vec<f64> {
        let delta = hyp.length - reference.length;
        let penalty = (-(delta * delta) / (2. * self.sigma * self.sigma)).exp();
        (0..self.n)
            .map(|order| {
                let mut val = 0f64;
                for (ngram, &w) in hyp.weights[order].iter() {
                    if let Some(&r) = reference.weights[order].get(ngram) {
                        // clipped counts
                        val += w.min(r) * r;
                    }
                }
                if hyp.norms[order] != 0. && reference.norms[order] != 0. {
                    val /= hyp.norms[order] * reference.norms[order];
                }
                val * penalty
            })
            .collect()
    }
}
