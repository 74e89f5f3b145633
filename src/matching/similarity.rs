// src/matching/similarity.rs

use strsim::jaro_winkler;

/// Order-independent similarity of two normalized labels in [0, 1].
///
/// Each token is paired with its best Jaro-Winkler match on the other side and
/// the two directional means are averaged, so "smith susan" and "susan smyth"
/// score close to 1.0 while an extra middle name costs only a little. The
/// sorted-string Jaro-Winkler is taken as a floor for labels that tokenize
/// differently ("mary ann" vs "maryann").
pub fn token_set_similarity(a: &str, b: &str) -> f64 {
    let mut tokens_a: Vec<&str> = a.split_whitespace().collect();
    let mut tokens_b: Vec<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    tokens_a.sort_unstable();
    tokens_b.sort_unstable();
    if tokens_a == tokens_b {
        return 1.0;
    }

    let directional = |from: &[&str], to: &[&str]| -> f64 {
        let total: f64 = from
            .iter()
            .map(|t| to.iter().map(|o| jaro_winkler(t, o)).fold(0.0, f64::max))
            .sum();
        total / from.len() as f64
    };
    let token_score = (directional(&tokens_a, &tokens_b) + directional(&tokens_b, &tokens_a)) / 2.0;
    let sorted_score = jaro_winkler(&tokens_a.join(" "), &tokens_b.join(" "));
    token_score.max(sorted_score).clamp(0.0, 1.0)
}

/// Best similarity of `label` against any of `others`.
pub fn best_similarity<'a, I>(label: &str, others: I) -> f64
where
    I: IntoIterator<Item = &'a str>,
{
    others
        .into_iter()
        .map(|o| token_set_similarity(label, o))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_and_reordered_tokens_score_one() {
        assert_eq!(token_set_similarity("susan smith", "susan smith"), 1.0);
        assert_eq!(token_set_similarity("smith susan", "susan smith"), 1.0);
    }

    #[test]
    fn test_empty_input_scores_zero() {
        assert_eq!(token_set_similarity("", "susan smith"), 0.0);
        assert_eq!(token_set_similarity("susan", "   "), 0.0);
    }

    #[test]
    fn test_misspelling_scores_high_but_unrelated_low() {
        let close = token_set_similarity("susana smyth", "susan smith");
        assert!(close > 0.85 && close < 1.0, "got {}", close);
        let far = token_set_similarity("robert jones", "susan smith");
        assert!(far < 0.6, "got {}", far);
    }

    #[test]
    fn test_symmetric() {
        let ab = token_set_similarity("mary ann lee", "maryann lee");
        let ba = token_set_similarity("maryann lee", "mary ann lee");
        assert!((ab - ba).abs() < 1e-12);
        assert!(ab > 0.8);
    }

    #[test]
    fn test_best_similarity_picks_max_alias() {
        let aliases = ["sue smith", "susan smith"];
        assert_eq!(best_similarity("susan smith", aliases.iter().copied()), 1.0);
        assert_eq!(best_similarity("susan smith", std::iter::empty()), 0.0);
    }
}
