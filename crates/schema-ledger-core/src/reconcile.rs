//! Canonical-identifier resolution for backfills over messy historical data.
//!
//! Computing the mapping is pure and deterministic; writing it is left to the
//! caller (typically through [`crate::batch::batch_process`]). Records that
//! cannot be resolved are returned as anomalies instead of failing the run,
//! unless the caller asks for strict mode.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Any unresolved or ambiguous record fails the reconciliation.
    Strict,
    /// Unresolved records are skipped and reported.
    #[default]
    BestEffort,
}

/// A row that could own the natural key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub natural_key: String,
    pub canonical_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub secondary_key: String,
}

impl Candidate {
    /// Preference order, best first: newest `created_at`, then greatest
    /// `secondary_key`, then smallest `canonical_id`.
    fn preference(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.created_at
            .cmp(&lhs.created_at)
            .then_with(|| rhs.secondary_key.cmp(&lhs.secondary_key))
            .then_with(|| lhs.canonical_id.cmp(&rhs.canonical_id))
    }

    fn ties_with(&self, other: &Self) -> bool {
        self.created_at == other.created_at && self.secondary_key == other.secondary_key
    }
}

/// A row that needs a canonical identifier for its natural key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub subject_id: String,
    pub natural_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub subject_id: String,
    pub natural_key: String,
    pub canonical_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// No candidate exists for the subject's natural key; the subject is left
    /// out of the assignments.
    Unresolved {
        subject_id: String,
        natural_key: String,
    },
    /// Several candidates claimed the key; the preferred one was chosen.
    Conflict {
        natural_key: String,
        chosen: String,
        rejected: Vec<String>,
    },
    /// The best candidates tie on every preference field; the smallest
    /// canonical id was chosen.
    Ambiguous {
        natural_key: String,
        chosen: String,
        tied: Vec<String>,
    },
}

impl Anomaly {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unresolved { .. } => "unresolved",
            Self::Conflict { .. } => "conflict",
            Self::Ambiguous { .. } => "ambiguous",
        }
    }

    /// Whether strict mode refuses to continue past this anomaly.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Conflict { .. })
    }
}

impl Display for Anomaly {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved {
                subject_id,
                natural_key,
            } => {
                write!(
                    f,
                    "subject {subject_id} has no candidate for key {natural_key}"
                )
            }
            Self::Conflict {
                natural_key,
                chosen,
                rejected,
            } => {
                write!(
                    f,
                    "key {natural_key} resolved to {chosen}; rejected {}",
                    rejected.join(", ")
                )
            }
            Self::Ambiguous {
                natural_key,
                chosen,
                tied,
            } => {
                write!(
                    f,
                    "key {natural_key} tied between {}; chose {chosen}",
                    tied.join(", ")
                )
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconciliation {
    /// Sorted by `subject_id`, then `natural_key`.
    pub assignments: Vec<Assignment>,
    pub anomalies: Vec<Anomaly>,
}

impl Reconciliation {
    /// Emit every anomaly as a structured warning.
    pub fn log_anomalies(&self, context: &str) {
        for anomaly in &self.anomalies {
            let detail = serde_json::to_string(anomaly)
                .unwrap_or_else(|_| anomaly.to_string());
            warn!(context, kind = anomaly.kind(), %detail, "reconciliation anomaly: {anomaly}");
        }
    }

    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.anomalies
            .iter()
            .filter(|anomaly| matches!(anomaly, Anomaly::Unresolved { .. }))
            .count()
    }
}

/// Pick one candidate per natural key. Conflicts and full ties are reported
/// alongside the winners, ordered by natural key.
#[must_use]
pub fn resolve_canonical(candidates: &[Candidate]) -> (BTreeMap<String, Candidate>, Vec<Anomaly>) {
    let mut by_key: BTreeMap<&str, Vec<&Candidate>> = BTreeMap::new();
    for candidate in candidates {
        by_key
            .entry(candidate.natural_key.as_str())
            .or_default()
            .push(candidate);
    }

    let mut winners = BTreeMap::new();
    let mut anomalies = Vec::new();
    for (natural_key, mut group) in by_key {
        group.sort_by(|lhs, rhs| Candidate::preference(lhs, rhs));
        let Some(best) = group.first().copied() else {
            continue;
        };

        let tied = group
            .iter()
            .filter(|other| other.ties_with(best) && other.canonical_id != best.canonical_id)
            .map(|other| other.canonical_id.clone())
            .collect::<Vec<_>>();

        if tied.is_empty() {
            let mut rejected = group
                .iter()
                .filter(|other| other.canonical_id != best.canonical_id)
                .map(|other| other.canonical_id.clone())
                .collect::<Vec<_>>();
            rejected.sort();
            rejected.dedup();
            if !rejected.is_empty() {
                anomalies.push(Anomaly::Conflict {
                    natural_key: natural_key.to_string(),
                    chosen: best.canonical_id.clone(),
                    rejected,
                });
            }
        } else {
            let mut tied_ids = tied;
            tied_ids.push(best.canonical_id.clone());
            tied_ids.sort();
            tied_ids.dedup();
            anomalies.push(Anomaly::Ambiguous {
                natural_key: natural_key.to_string(),
                chosen: best.canonical_id.clone(),
                tied: tied_ids,
            });
        }

        winners.insert(natural_key.to_string(), best.clone());
    }

    (winners, anomalies)
}

/// Assign a canonical identifier to each subject.
///
/// # Errors
/// In `Strict` mode, returns `Rejected` when any subject is unresolved or any
/// key is ambiguous. `BestEffort` never fails.
pub fn reconcile(
    subjects: &[Subject],
    candidates: &[Candidate],
    mode: ReconcileMode,
) -> Result<Reconciliation, ReconcileError> {
    let (winners, mut anomalies) = resolve_canonical(candidates);

    let mut assignments = Vec::with_capacity(subjects.len());
    let mut unresolved = Vec::new();
    for subject in subjects {
        match winners.get(&subject.natural_key) {
            Some(winner) => assignments.push(Assignment {
                subject_id: subject.subject_id.clone(),
                natural_key: subject.natural_key.clone(),
                canonical_id: winner.canonical_id.clone(),
            }),
            None => unresolved.push(subject),
        }
    }
    assignments.sort_by(|lhs, rhs| {
        lhs.subject_id
            .cmp(&rhs.subject_id)
            .then_with(|| lhs.natural_key.cmp(&rhs.natural_key))
    });
    unresolved.sort_by(|lhs, rhs| {
        lhs.subject_id
            .cmp(&rhs.subject_id)
            .then_with(|| lhs.natural_key.cmp(&rhs.natural_key))
    });
    anomalies.extend(unresolved.into_iter().map(|subject| Anomaly::Unresolved {
        subject_id: subject.subject_id.clone(),
        natural_key: subject.natural_key.clone(),
    }));

    if mode == ReconcileMode::Strict {
        let blocking = anomalies
            .iter()
            .filter(|anomaly| anomaly.is_blocking())
            .collect::<Vec<_>>();
        if let Some(first) = blocking.first() {
            return Err(ReconcileError::Rejected {
                count: blocking.len(),
                first: first.to_string(),
            });
        }
    }

    Ok(Reconciliation {
        assignments,
        anomalies,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn at(seconds: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(seconds)
    }

    fn candidate(key: &str, id: &str, created: i64, secondary: &str) -> Candidate {
        Candidate {
            natural_key: key.to_string(),
            canonical_id: id.to_string(),
            created_at: at(created),
            secondary_key: secondary.to_string(),
        }
    }

    fn subject(id: &str, key: &str) -> Subject {
        Subject {
            subject_id: id.to_string(),
            natural_key: key.to_string(),
        }
    }

    fn seeded_permutation<T: Clone>(items: &[T], seed: u64) -> Vec<T> {
        fn splitmix64(mut value: u64) -> u64 {
            value = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
            value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            value ^ (value >> 31)
        }

        let mut keyed = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let index_u64 = u64::try_from(index).unwrap_or(u64::MAX);
                (splitmix64(seed ^ index_u64), item.clone())
            })
            .collect::<Vec<_>>();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, item)| item).collect()
    }

    #[test]
    fn newest_candidate_wins_and_conflict_is_reported() {
        let candidates = vec![
            candidate("alice@example.com", "user-1", 100, "a"),
            candidate("alice@example.com", "user-7", 300, "a"),
            candidate("alice@example.com", "user-4", 200, "z"),
        ];
        let (winners, anomalies) = resolve_canonical(&candidates);
        assert_eq!(
            winners
                .get("alice@example.com")
                .map(|c| c.canonical_id.as_str()),
            Some("user-7")
        );
        assert_eq!(
            anomalies,
            vec![Anomaly::Conflict {
                natural_key: "alice@example.com".to_string(),
                chosen: "user-7".to_string(),
                rejected: vec!["user-1".to_string(), "user-4".to_string()],
            }]
        );
    }

    #[test]
    fn equal_timestamps_fall_back_to_greatest_secondary_key() {
        let candidates = vec![
            candidate("team-1", "policy-a", 500, "2023-07-21"),
            candidate("team-1", "policy-b", 500, "2025-09-02"),
            candidate("team-1", "policy-c", 500, "2024-01-01"),
        ];
        let (winners, anomalies) = resolve_canonical(&candidates);
        assert_eq!(
            winners.get("team-1").map(|c| c.canonical_id.as_str()),
            Some("policy-b")
        );
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind(), "conflict");
    }

    #[test]
    fn duplicate_rows_for_the_same_id_are_not_conflicts() {
        let candidates = vec![
            candidate("bob", "user-2", 10, "x"),
            candidate("bob", "user-2", 20, "x"),
        ];
        let (winners, anomalies) = resolve_canonical(&candidates);
        assert_eq!(winners.get("bob").map(|c| c.created_at), Some(at(20)));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn full_ties_are_ambiguous_and_pick_smallest_id() {
        let candidates = vec![
            candidate("k", "id-9", 1, "s"),
            candidate("k", "id-3", 1, "s"),
        ];
        let (winners, anomalies) = resolve_canonical(&candidates);
        assert_eq!(
            winners.get("k").map(|c| c.canonical_id.as_str()),
            Some("id-3")
        );
        assert_eq!(
            anomalies,
            vec![Anomaly::Ambiguous {
                natural_key: "k".to_string(),
                chosen: "id-3".to_string(),
                tied: vec!["id-3".to_string(), "id-9".to_string()],
            }]
        );
    }

    #[test]
    fn unresolved_subjects_are_skipped_in_best_effort_mode() -> anyhow::Result<()> {
        let subjects = vec![
            subject("row-2", "carol"),
            subject("row-1", "alice"),
            subject("row-3", "nobody"),
        ];
        let candidates = vec![
            candidate("alice", "user-1", 1, ""),
            candidate("carol", "user-3", 1, ""),
        ];

        let result = reconcile(&subjects, &candidates, ReconcileMode::BestEffort)?;
        let assigned = result
            .assignments
            .iter()
            .map(|assignment| (assignment.subject_id.as_str(), assignment.canonical_id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(assigned, vec![("row-1", "user-1"), ("row-2", "user-3")]);
        assert_eq!(result.unresolved_count(), 1);
        assert_eq!(
            result.anomalies,
            vec![Anomaly::Unresolved {
                subject_id: "row-3".to_string(),
                natural_key: "nobody".to_string(),
            }]
        );
        result.log_anomalies("test");
        Ok(())
    }

    #[test]
    fn unresolved_anomalies_do_not_depend_on_subject_order() -> anyhow::Result<()> {
        let forward = [subject("r1", "x"), subject("r2", "y")];
        let backward = [subject("r2", "y"), subject("r1", "x")];

        let lhs = reconcile(&forward, &[], ReconcileMode::BestEffort)?;
        let rhs = reconcile(&backward, &[], ReconcileMode::BestEffort)?;
        assert_eq!(lhs, rhs);
        let ids = lhs
            .anomalies
            .iter()
            .map(|anomaly| match anomaly {
                Anomaly::Unresolved { subject_id, .. } => subject_id.as_str(),
                _ => "",
            })
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["r1", "r2"]);
        Ok(())
    }

    #[test]
    fn strict_mode_rejects_unresolved_but_tolerates_conflicts() {
        let subjects = vec![subject("row-1", "alice"), subject("row-2", "nobody")];
        let candidates = vec![
            candidate("alice", "user-1", 1, ""),
            candidate("alice", "user-2", 2, ""),
        ];

        let err = reconcile(&subjects, &candidates, ReconcileMode::Strict);
        assert_eq!(
            err,
            Err(ReconcileError::Rejected {
                count: 1,
                first: "subject row-2 has no candidate for key nobody".to_string(),
            })
        );

        let ok = reconcile(&subjects[..1], &candidates, ReconcileMode::Strict)
            .unwrap_or_else(|err| panic!("conflict alone must not block: {err}"));
        assert_eq!(ok.anomalies.len(), 1);
        assert_eq!(ok.assignments.len(), 1);
    }

    proptest! {
        #[test]
        fn property_resolution_is_stable_under_seeded_permutations(
            seed_a in any::<u64>(),
            seed_b in any::<u64>(),
        ) {
            let candidates = vec![
                candidate("alice", "user-1", 100, "b"),
                candidate("alice", "user-2", 100, "c"),
                candidate("alice", "user-3", 50, "z"),
                candidate("bob", "user-4", 10, "a"),
                candidate("bob", "user-5", 10, "a"),
                candidate("carol", "user-6", 7, "q"),
            ];
            let subjects = vec![
                subject("s-1", "alice"),
                subject("s-2", "bob"),
                subject("s-3", "carol"),
                subject("s-4", "dave"),
                subject("s-0", "erin"),
            ];

            let run = |seed: u64| {
                reconcile(
                    &seeded_permutation(&subjects, seed),
                    &seeded_permutation(&candidates, seed.rotate_left(17)),
                    ReconcileMode::BestEffort,
                )
            };
            let result_a = run(seed_a);
            let result_b = run(seed_b);
            prop_assert!(result_a.is_ok());
            prop_assert_eq!(&result_a, &result_b);

            let result = result_a.unwrap_or_else(|_| unreachable!());
            let canonical_for = |key: &str| {
                result
                    .assignments
                    .iter()
                    .find(|assignment| assignment.natural_key == key)
                    .map(|assignment| assignment.canonical_id.clone())
            };
            prop_assert_eq!(canonical_for("alice"), Some("user-2".to_string()));
            prop_assert_eq!(canonical_for("bob"), Some("user-4".to_string()));
        }
    }
}
