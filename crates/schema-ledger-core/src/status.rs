use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::version::Version;

/// Comparison between the versions this binary knows and the versions the
/// database has recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationStatus {
    NoMigrationsCompleted,
    AllMigrationsCompleted,
    SomeMigrationsCompleted { missing: Vec<Version> },
    /// The database is ahead of this binary, e.g. an older release running
    /// against a newer schema.
    UnknownMigrations { unknown: Vec<Version> },
}

impl MigrationStatus {
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Self::AllMigrationsCompleted)
    }
}

/// Classify `applied` against `known`. Applied versions listed in
/// `known_unknowns` are tolerated when absent from `known`.
///
/// Unknown versions take precedence over missing ones.
#[must_use]
pub fn compare_versions(
    known: &[Version],
    applied: &[Version],
    known_unknowns: &[Version],
) -> MigrationStatus {
    if applied.is_empty() {
        return if known.is_empty() {
            MigrationStatus::AllMigrationsCompleted
        } else {
            MigrationStatus::NoMigrationsCompleted
        };
    }

    let known_set = known.iter().copied().collect::<BTreeSet<_>>();
    let applied_set = applied.iter().copied().collect::<BTreeSet<_>>();
    let tolerated = known_unknowns.iter().copied().collect::<BTreeSet<_>>();

    let unknown = applied_set
        .iter()
        .filter(|version| !known_set.contains(version) && !tolerated.contains(version))
        .copied()
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        return MigrationStatus::UnknownMigrations { unknown };
    }

    let missing = known_set
        .difference(&applied_set)
        .copied()
        .collect::<Vec<_>>();
    if missing.is_empty() {
        MigrationStatus::AllMigrationsCompleted
    } else {
        MigrationStatus::SomeMigrationsCompleted { missing }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(raw: &[i64]) -> Vec<Version> {
        raw.iter().copied().map(Version).collect()
    }

    #[test]
    fn empty_database_reports_no_migrations_completed() {
        assert_eq!(
            compare_versions(&versions(&[1, 2]), &[], &[]),
            MigrationStatus::NoMigrationsCompleted
        );
        assert_eq!(
            compare_versions(&[], &[], &[]),
            MigrationStatus::AllMigrationsCompleted
        );
    }

    #[test]
    fn equal_sets_are_up_to_date_in_any_order() {
        let status = compare_versions(&versions(&[1, 2, 3]), &versions(&[3, 1, 2]), &[]);
        assert!(status.is_up_to_date());
    }

    #[test]
    fn missing_versions_are_listed_ascending() {
        assert_eq!(
            compare_versions(&versions(&[1, 2, 3, 4]), &versions(&[1, 3]), &[]),
            MigrationStatus::SomeMigrationsCompleted {
                missing: versions(&[2, 4]),
            }
        );
    }

    #[test]
    fn unknown_versions_win_over_missing_and_respect_allowlist() {
        assert_eq!(
            compare_versions(&versions(&[1, 2, 3]), &versions(&[1, 9]), &[]),
            MigrationStatus::UnknownMigrations {
                unknown: versions(&[9]),
            }
        );
        assert_eq!(
            compare_versions(
                &versions(&[1, 2]),
                &versions(&[1, 2, 20_210_924_114_500]),
                &versions(&[20_210_924_114_500])
            ),
            MigrationStatus::AllMigrationsCompleted
        );
    }

    #[test]
    fn status_serializes_with_tag() -> anyhow::Result<()> {
        let json = serde_json::to_value(MigrationStatus::SomeMigrationsCompleted {
            missing: versions(&[5]),
        })?;
        assert_eq!(
            json,
            serde_json::json!({"status": "some_migrations_completed", "missing": [5]})
        );
        Ok(())
    }
}
