// src/matching/scoring.rs

use crate::config::{KindSettings, Weights};
use crate::models::{EntityKind, Identifier, IdentifierKind, MatchSignals};

/// Identifier kinds an entity carries at most one true value of. A candidate
/// with a different value of one of these is a different entity.
const EXCLUSIVE_KINDS: [IdentifierKind; 2] = [IdentifierKind::Microchip, IdentifierKind::ExternalGeocodeKey];

pub fn weighted_sum(weights: &Weights, signals: &MatchSignals) -> f64 {
    weights.phone * signals.phone_match
        + weights.email * signals.email_match
        + weights.name_similarity * signals.name_similarity
        + weights.shared_address * flag(signals.shared_address)
        + weights.shared_relationship * flag(signals.shared_relationship)
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Final confidence in [0, 1]. Exact identifier evidence pins the score at the
/// top; everything else is the trust-scaled weighted sum.
pub fn score(settings: &KindSettings, signals: &MatchSignals, deterministic: bool, trust: f64) -> f64 {
    if deterministic {
        return 1.0;
    }
    (weighted_sum(&settings.weights, signals) * trust).clamp(0.0, 1.0)
}

/// Why a candidate must not be merged automatically, if anything.
pub fn conflict_reason(
    kind: EntityKind,
    settings: &KindSettings,
    record_identifiers: &[Identifier],
    candidate_identifiers: &[Identifier],
    signals: &MatchSignals,
    deterministic: bool,
    record_has_name: bool,
) -> Option<String> {
    for exclusive in EXCLUSIVE_KINDS {
        let ours: Vec<&Identifier> = record_identifiers.iter().filter(|i| i.kind == exclusive).collect();
        let theirs: Vec<&Identifier> = candidate_identifiers.iter().filter(|i| i.kind == exclusive).collect();
        if !ours.is_empty() && !theirs.is_empty() && !ours.iter().any(|i| theirs.contains(i)) {
            return Some(format!("candidate carries a different {}", exclusive));
        }
    }

    if !deterministic {
        if let Some(shared) = signals.conflicting_identifiers.first() {
            return Some(format!("only link is {} which several entities share", shared));
        }
    }

    if deterministic
        && kind == EntityKind::Person
        && record_has_name
        && signals.name_similarity < settings.min_identifier_name_similarity
    {
        return Some(format!(
            "identifier matches but name similarity {:.2} is below {:.2}",
            signals.name_similarity, settings.min_identifier_name_similarity
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_settings() -> KindSettings {
        KindSettings::default_for(EntityKind::Person)
    }

    #[test]
    fn test_fuzzy_name_and_shared_address_lands_between_thresholds() {
        let settings = person_settings();
        let signals = MatchSignals {
            name_similarity: 0.8,
            shared_address: true,
            ..Default::default()
        };
        let s = score(&settings, &signals, false, 1.0);
        assert!((s - 0.69).abs() < 1e-9, "got {}", s);
        assert!(s >= settings.review_threshold && s < settings.auto_merge_threshold);
    }

    #[test]
    fn test_deterministic_is_pinned_and_fuzzy_is_clamped() {
        let settings = person_settings();
        let weak = MatchSignals {
            phone_match: 1.0,
            ..Default::default()
        };
        assert_eq!(score(&settings, &weak, true, 0.5), 1.0);

        let everything = MatchSignals {
            phone_match: 1.0,
            email_match: 1.0,
            name_similarity: 1.0,
            shared_address: true,
            shared_relationship: true,
            ..Default::default()
        };
        assert_eq!(score(&settings, &everything, false, 1.2), 1.0);
    }

    #[test]
    fn test_trust_scales_fuzzy_score() {
        let settings = person_settings();
        let signals = MatchSignals {
            name_similarity: 1.0,
            ..Default::default()
        };
        let full = score(&settings, &signals, false, 1.0);
        let distrusted = score(&settings, &signals, false, 0.5);
        assert!((distrusted - full * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_conflicting_microchip_blocks_merge() {
        let settings = KindSettings::default_for(EntityKind::Cat);
        let ours = [Identifier::new(IdentifierKind::Microchip, "985112012345678")];
        let theirs = [Identifier::new(IdentifierKind::Microchip, "985112099999999")];
        let reason = conflict_reason(EntityKind::Cat, &settings, &ours, &theirs, &MatchSignals::default(), false, true);
        assert!(reason.unwrap().contains("microchip"));
        assert!(conflict_reason(EntityKind::Cat, &settings, &ours, &[], &MatchSignals::default(), false, true).is_none());
    }

    #[test]
    fn test_identifier_only_person_match_needs_a_similar_name() {
        let settings = person_settings();
        let mut signals = MatchSignals {
            phone_match: 1.0,
            name_similarity: 0.3,
            ..Default::default()
        };
        assert!(conflict_reason(EntityKind::Person, &settings, &[], &[], &signals, true, true).is_some());
        // Nameless records cannot contradict.
        assert!(conflict_reason(EntityKind::Person, &settings, &[], &[], &signals, true, false).is_none());
        signals.name_similarity = 0.9;
        assert!(conflict_reason(EntityKind::Person, &settings, &[], &[], &signals, true, true).is_none());
    }

    #[test]
    fn test_shared_identifier_alone_is_a_conflict() {
        let settings = person_settings();
        let shared = Identifier::new(IdentifierKind::Phone, "7075550000");
        let signals = MatchSignals {
            phone_match: settings.conflict_signal_factor,
            conflicting_identifiers: vec![shared],
            ..Default::default()
        };
        assert!(conflict_reason(EntityKind::Person, &settings, &[], &[], &signals, false, true).is_some());
        assert!(conflict_reason(EntityKind::Person, &settings, &[], &[], &signals, true, false).is_none());
    }
}
