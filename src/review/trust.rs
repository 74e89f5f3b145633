// src/review/trust.rs
//
// Per-(kind, source) trust weights nudged by review outcomes. A confirmed
// match raises the source's weight by one step, a rejection lowers it, and
// the result always stays within the configured floor and ceiling.

use log::debug;

use crate::audit;
use crate::config::TrustSettings;
use crate::models::EntityKind;
use crate::store::{Store, StoreResult, TrustUpdate, UnitOfWork};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustFeedback {
    Confirmed,
    Rejected,
}

impl TrustFeedback {
    fn delta(self, settings: &TrustSettings) -> f64 {
        match self {
            Self::Confirmed => settings.step,
            Self::Rejected => -settings.step,
        }
    }
}

/// Current weight for a source, or the configured default.
pub async fn current_weight(
    store: &dyn Store,
    settings: &TrustSettings,
    kind: EntityKind,
    source_system: &str,
) -> StoreResult<f64> {
    Ok(store
        .trust_weight(kind, source_system)
        .await?
        .unwrap_or(settings.default_weight))
}

/// Adds the trust change for one review outcome to `unit`. Returns
/// (before, after); no write is added when the weight is already at a bound.
pub async fn plan_trust_adjustment(
    store: &dyn Store,
    settings: &TrustSettings,
    kind: EntityKind,
    source_system: &str,
    feedback: TrustFeedback,
    actor: &str,
    unit: &mut UnitOfWork,
) -> StoreResult<(f64, f64)> {
    let before = current_weight(store, settings, kind, source_system).await?;
    let after = settings.clamp(before + feedback.delta(settings));
    if (after - before).abs() > f64::EPSILON {
        unit.trust_updates.push(TrustUpdate {
            kind,
            source_system: source_system.to_string(),
            weight: after,
        });
        unit.audit(audit::trust_adjusted(kind, source_system, before, after, actor, unit.at));
        debug!(
            "Trust for {} from {}: {:.3} -> {:.3} ({:?})",
            kind, source_system, before, after, feedback
        );
    }
    Ok((before, after))
}
