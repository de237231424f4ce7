//! # Loyalty Drift Policy
//!
//! Classifies the difference between the POS and CRM loyalty balances of a
//! customer and decides whether the local balance is overwritten.
//!
//! ```text
//! ┌──────────────────────┬───────────────┬───────────┬──────────────────────┐
//! │ |pos - crm|          │ action        │ status    │ local balance        │
//! ├──────────────────────┼───────────────┼───────────┼──────────────────────┤
//! │ 0                    │ NONE          │ RESOLVED  │ untouched            │
//! │ 1 ..= auto_sync      │ AUTO_SYNC     │ RESOLVED  │ set to crm           │
//! │ auto_sync+1 ..= alert│ SYNC_WITH_LOG │ RESOLVED  │ set to crm + note    │
//! │ > alert              │ MANUAL_REVIEW │ PENDING   │ untouched            │
//! │ fetch failed         │ FAILED        │ FAILED    │ untouched            │
//! │ out of i64 range     │ FAILED        │ FAILED    │ untouched            │
//! └──────────────────────┴───────────────┴───────────┴──────────────────────┘
//! ```
//!
//! The CRM is the source of truth whenever a balance is overwritten.

use serde::{Deserialize, Serialize};

use crate::types::{ReconciliationAction, ReconciliationStatus};

/// Default band within which drift is corrected silently.
pub const DEFAULT_AUTO_SYNC_THRESHOLD: i64 = 10;

/// Default drift beyond which an operator must decide.
pub const DEFAULT_ALERT_THRESHOLD: i64 = 100;

/// Threshold pair for drift classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftThresholds {
    pub auto_sync: i64,
    pub alert: i64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        DriftThresholds {
            auto_sync: DEFAULT_AUTO_SYNC_THRESHOLD,
            alert: DEFAULT_ALERT_THRESHOLD,
        }
    }
}

/// The decision for one customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftDecision {
    pub pos_points: i64,
    pub crm_points: i64,
    pub discrepancy: i64,
    pub action: ReconciliationAction,
    pub status: ReconciliationStatus,
    /// Some(balance) when the local balance must be overwritten.
    pub new_local_points: Option<i64>,
    pub note: String,
}

impl DriftThresholds {
    /// Classifies a pair of balances.
    ///
    /// ## Example
    /// ```rust
    /// use tally_core::drift::DriftThresholds;
    /// use tally_core::ReconciliationAction;
    ///
    /// let decision = DriftThresholds::default().classify(150, 145);
    /// assert_eq!(decision.action, ReconciliationAction::AutoSync);
    /// assert_eq!(decision.new_local_points, Some(145));
    /// ```
    pub fn classify(&self, pos_points: i64, crm_points: i64) -> DriftDecision {
        let Some((discrepancy, magnitude)) = pos_points
            .checked_sub(crm_points)
            .and_then(|d| d.checked_abs().map(|m| (d, m)))
        else {
            return failed(
                pos_points,
                crm_points,
                format!(
                    "Balance difference out of range (POS {}, CRM {})",
                    pos_points, crm_points
                ),
            );
        };

        let (action, status, new_local_points, note) = if magnitude == 0 {
            (
                ReconciliationAction::None,
                ReconciliationStatus::Resolved,
                None,
                "Points match".to_string(),
            )
        } else if magnitude <= self.auto_sync {
            (
                ReconciliationAction::AutoSync,
                ReconciliationStatus::Resolved,
                Some(crm_points),
                format!("Auto-synced: {} points difference", discrepancy),
            )
        } else if magnitude > self.alert {
            (
                ReconciliationAction::ManualReview,
                ReconciliationStatus::Pending,
                None,
                format!(
                    "Large discrepancy of {} points requires manual review (POS {}, CRM {})",
                    discrepancy, pos_points, crm_points
                ),
            )
        } else {
            (
                ReconciliationAction::SyncWithLog,
                ReconciliationStatus::Resolved,
                Some(crm_points),
                format!(
                    "Synced with audit: POS {} adjusted to CRM {} ({} points difference)",
                    pos_points, crm_points, discrepancy
                ),
            )
        };

        DriftDecision {
            pos_points,
            crm_points,
            discrepancy,
            action,
            status,
            new_local_points,
            note,
        }
    }
}

fn failed(pos_points: i64, crm_points: i64, note: String) -> DriftDecision {
    DriftDecision {
        pos_points,
        crm_points,
        discrepancy: pos_points.saturating_sub(crm_points),
        action: ReconciliationAction::Failed,
        status: ReconciliationStatus::Failed,
        new_local_points: None,
        note,
    }
}

/// Decision recorded when the remote balance could not be read.
pub fn fetch_failed(pos_points: i64, reason: &str) -> DriftDecision {
    failed(
        pos_points,
        0,
        format!("Failed to fetch CRM balance: {}", reason),
    )
}

/// Decision recorded when the CRM balance was read but could not be written
/// locally. The local balance stays as it was.
pub fn apply_failed(decision: &DriftDecision, reason: &str) -> DriftDecision {
    failed(
        decision.pos_points,
        decision.crm_points,
        format!(
            "Failed to apply CRM balance {}: {}",
            decision.crm_points, reason
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_drift_auto_syncs_to_remote() {
        let d = DriftThresholds::default().classify(150, 145);
        assert_eq!(d.discrepancy, 5);
        assert_eq!(d.action, ReconciliationAction::AutoSync);
        assert_eq!(d.status, ReconciliationStatus::Resolved);
        assert_eq!(d.new_local_points, Some(145));
    }

    #[test]
    fn test_large_drift_needs_review() {
        let d = DriftThresholds::default().classify(500, 200);
        assert_eq!(d.discrepancy, 300);
        assert_eq!(d.action, ReconciliationAction::ManualReview);
        assert_eq!(d.status, ReconciliationStatus::Pending);
        assert_eq!(d.new_local_points, None);
    }

    #[test]
    fn test_matching_balances_do_nothing() {
        let d = DriftThresholds::default().classify(100, 100);
        assert_eq!(d.action, ReconciliationAction::None);
        assert_eq!(d.new_local_points, None);
    }

    #[test]
    fn test_medium_band_syncs_with_log() {
        let t = DriftThresholds::default();
        let d = t.classify(100, 150);
        assert_eq!(d.discrepancy, -50);
        assert_eq!(d.action, ReconciliationAction::SyncWithLog);
        assert_eq!(d.new_local_points, Some(150));
    }

    #[test]
    fn test_band_edges() {
        let t = DriftThresholds::default();
        assert_eq!(t.classify(10, 0).action, ReconciliationAction::AutoSync);
        assert_eq!(t.classify(11, 0).action, ReconciliationAction::SyncWithLog);
        assert_eq!(t.classify(100, 0).action, ReconciliationAction::SyncWithLog);
        assert_eq!(t.classify(101, 0).action, ReconciliationAction::ManualReview);
        assert_eq!(t.classify(0, 101).action, ReconciliationAction::ManualReview);
    }

    #[test]
    fn test_fetch_failed_records_local_as_discrepancy() {
        let d = fetch_failed(42, "timeout");
        assert_eq!(d.crm_points, 0);
        assert_eq!(d.discrepancy, 42);
        assert_eq!(d.action, ReconciliationAction::Failed);
        assert_eq!(d.status, ReconciliationStatus::Failed);
        assert!(d.note.contains("timeout"));
    }

    #[test]
    fn test_out_of_range_difference_fails_instead_of_overflowing() {
        let t = DriftThresholds::default();
        for (pos, crm) in [(5, i64::MIN), (i64::MIN, 0), (-1, i64::MAX)] {
            let d = t.classify(pos, crm);
            assert_eq!(d.action, ReconciliationAction::Failed);
            assert_eq!(d.status, ReconciliationStatus::Failed);
            assert_eq!(d.new_local_points, None);
        }
        assert_eq!(t.classify(5, i64::MIN).discrepancy, i64::MAX);
    }

    #[test]
    fn test_apply_failed_keeps_both_balances() {
        let d = apply_failed(&DriftThresholds::default().classify(150, 145), "disk full");
        assert_eq!(d.pos_points, 150);
        assert_eq!(d.crm_points, 145);
        assert_eq!(d.discrepancy, 5);
        assert_eq!(d.action, ReconciliationAction::Failed);
        assert_eq!(d.new_local_points, None);
        assert!(d.note.contains("disk full"));
    }
}
