use once_cell::sync::Lazy;
use regex::Regex;

/// Scoring weights for unified retrieval:
/// `α·semantic + β·importance + γ·(1/graph_distance) + δ·time_decay +
/// ε·access_frequency`.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalWeights {
    pub semantic: f32,
    pub importance: f32,
    pub graph: f32,
    pub time: f32,
    pub access: f32,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            importance: 0.2,
            graph: 0.2,
            time: 0.1,
            access: 0.1,
        }
    }
}

static CAUSAL_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(because|why|cause|caused|so|reason)\b").expect("causal regex is valid")
});

/// Causal queries widen graph expansion to depth 2.
pub fn is_causal_query(query: &str) -> bool {
    CAUSAL_KEYWORDS.is_match(query)
}

pub fn score_memory(
    weights: &RetrievalWeights,
    semantic: f32,
    importance: f32,
    graph_distance: u32,
    age_days: f32,
    access_count: i64,
) -> f32 {
    let graph_term = 1.0 / graph_distance.max(1) as f32;
    let time_term = 0.98f32.powf(age_days.max(0.0));
    let access_term = (access_count as f32 / 10.0).min(1.0);
    weights.semantic * semantic
        + weights.importance * importance
        + weights.graph * graph_term
        + weights.time * time_term
        + weights.access * access_term
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_query_detection() {
        assert!(is_causal_query("why am I tired today"));
        assert!(is_causal_query("I'm late because of traffic"));
        assert!(is_causal_query("what was the cause of that"));
        assert!(!is_causal_query("when do we meet"));
        // "so" only matches as a standalone word.
        assert!(!is_causal_query("socks and sofas"));
    }

    #[test]
    fn test_score_prefers_near_and_important() {
        let w = RetrievalWeights::default();
        let near = score_memory(&w, 0.9, 0.7, 1, 0.0, 5);
        let far = score_memory(&w, 0.9, 0.7, 2, 0.0, 5);
        assert!(near > far);

        let important = score_memory(&w, 0.5, 0.9, 1, 0.0, 0);
        let trivial = score_memory(&w, 0.5, 0.1, 1, 0.0, 0);
        assert!(important > trivial);

        let fresh = score_memory(&w, 0.5, 0.5, 1, 0.0, 0);
        let ancient = score_memory(&w, 0.5, 0.5, 1, 365.0, 0);
        assert!(fresh > ancient);
    }
}
