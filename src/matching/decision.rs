// src/matching/decision.rs

use std::cmp::Ordering;

use crate::config::KindSettings;
use crate::models::MatchCandidate;
use crate::utils::constants::SCORE_EPSILON;

/// What to do with one scored record.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    AutoMerge {
        winner: MatchCandidate,
        /// Conflict-free candidates tied with the winner. They look like
        /// duplicates of each other and are flagged for review.
        tied: Vec<MatchCandidate>,
    },
    ReviewNeeded {
        reason: String,
    },
    NewEntity,
}

/// Best score first, then the older entity, then id for a stable order.
pub fn rank_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.entity_created_at.cmp(&b.entity_created_at))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
}

/// Classifies ranked candidates. `blocked` forces review (a failed geocode,
/// for example) regardless of scores.
pub fn decide(
    ranked: &[MatchCandidate],
    settings: &KindSettings,
    can_create_entities: bool,
    blocked: Option<&str>,
) -> Verdict {
    if let Some(reason) = blocked {
        return Verdict::ReviewNeeded {
            reason: reason.to_string(),
        };
    }

    let top = match ranked.first() {
        Some(top) => top,
        None => return new_or_review(can_create_entities, "no candidates"),
    };

    if top.score >= settings.auto_merge_threshold {
        if let Some(conflict) = &top.signals.identifier_conflict {
            return Verdict::ReviewNeeded {
                reason: format!(
                    "top candidate {} scored {:.2} but {}",
                    top.entity_id, top.score, conflict
                ),
            };
        }
        let tied = ranked[1..]
            .iter()
            .filter(|c| (c.score - top.score).abs() < SCORE_EPSILON && !c.has_conflict())
            .cloned()
            .collect();
        return Verdict::AutoMerge {
            winner: top.clone(),
            tied,
        };
    }

    if top.score >= settings.review_threshold {
        return Verdict::ReviewNeeded {
            reason: format!(
                "top candidate {} scored {:.2} (review at {:.2}, auto-merge at {:.2})",
                top.entity_id, top.score, settings.review_threshold, settings.auto_merge_threshold
            ),
        };
    }

    new_or_review(
        can_create_entities,
        &format!("best score {:.2} is below review threshold {:.2}", top.score, settings.review_threshold),
    )
}

fn new_or_review(can_create_entities: bool, why: &str) -> Verdict {
    if can_create_entities {
        Verdict::NewEntity
    } else {
        Verdict::ReviewNeeded {
            reason: format!("{}; source may not create entities", why),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityId, EntityKind, MatchSignals, MatchType};
    use chrono::{Duration, Utc};

    fn candidate(score: f64, age_days: i64) -> MatchCandidate {
        MatchCandidate {
            entity_id: EntityId::new(),
            kind: EntityKind::Person,
            match_type: MatchType::FuzzyName,
            signals: MatchSignals::default(),
            score,
            entity_created_at: Utc::now() - Duration::days(age_days),
        }
    }

    fn settings() -> KindSettings {
        KindSettings::default_for(EntityKind::Person)
    }

    #[test]
    fn test_thresholds_route_to_three_outcomes() {
        let s = settings();
        assert!(matches!(decide(&[candidate(1.0, 1)], &s, true, None), Verdict::AutoMerge { .. }));
        assert!(matches!(decide(&[candidate(0.7, 1)], &s, true, None), Verdict::ReviewNeeded { .. }));
        assert_eq!(decide(&[candidate(0.3, 1)], &s, true, None), Verdict::NewEntity);
        assert_eq!(decide(&[], &s, true, None), Verdict::NewEntity);
    }

    #[test]
    fn test_conflict_on_top_candidate_forces_review() {
        let mut top = candidate(1.0, 1);
        top.signals.identifier_conflict = Some("different microchip".into());
        match decide(&[top], &settings(), true, None) {
            Verdict::ReviewNeeded { reason } => assert!(reason.contains("different microchip")),
            other => panic!("expected review, got {:?}", other),
        }
    }

    #[test]
    fn test_enrich_only_source_sends_new_entities_to_review() {
        assert!(matches!(
            decide(&[candidate(0.1, 1)], &settings(), false, None),
            Verdict::ReviewNeeded { .. }
        ));
    }

    #[test]
    fn test_blocked_record_goes_to_review() {
        match decide(&[candidate(1.0, 1)], &settings(), true, Some("geocoding failed")) {
            Verdict::ReviewNeeded { reason } => assert_eq!(reason, "geocoding failed"),
            other => panic!("expected review, got {:?}", other),
        }
    }

    #[test]
    fn test_tie_prefers_older_entity_and_reports_the_other() {
        let newer = candidate(1.0, 1);
        let older = candidate(1.0, 30);
        let mut ranked = vec![newer.clone(), older.clone()];
        rank_candidates(&mut ranked);
        match decide(&ranked, &settings(), true, None) {
            Verdict::AutoMerge { winner, tied } => {
                assert_eq!(winner.entity_id, older.entity_id);
                assert_eq!(tied.len(), 1);
                assert_eq!(tied[0].entity_id, newer.entity_id);
            }
            other => panic!("expected auto merge, got {:?}", other),
        }
    }
}
