//! Pure comparison helpers used by the store to decide what changed.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

/// Result of comparing two identifier collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetDiff<T: Ord> {
    pub added: BTreeSet<T>,
    pub removed: BTreeSet<T>,
}

impl<T: Ord> SetDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compare two unordered collections. Duplicates and ordering are ignored.
pub fn set_diff<'a, T, I, J>(old: I, new: J) -> SetDiff<T>
where
    T: Ord + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
    J: IntoIterator<Item = &'a T>,
{
    let old: BTreeSet<&T> = old.into_iter().collect();
    let new: BTreeSet<&T> = new.into_iter().collect();

    SetDiff {
        added: new.difference(&old).map(|v| (*v).clone()).collect(),
        removed: old.difference(&new).map(|v| (*v).clone()).collect(),
    }
}

/// One scalar field that differs between two observations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: Value,
    pub new: Value,
}

/// Named accessor projecting a record onto one comparable value.
pub type Field<T> = (&'static str, fn(&T) -> Value);

/// Return the fields whose projected values differ, in selector order.
pub fn field_diff<T>(old: &T, new: &T, fields: &[Field<T>]) -> Vec<FieldChange> {
    fields
        .iter()
        .filter_map(|(name, project)| {
            let (before, after) = (project(old), project(new));
            (before != after).then_some(FieldChange {
                field: *name,
                old: before,
                new: after,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_set_diff_added_and_removed() {
        let old = ids(&["1", "2", "3"]);
        let new = ids(&["2", "3", "4"]);
        let diff = set_diff(&old, &new);
        assert_eq!(diff.added, BTreeSet::from(["4".to_string()]));
        assert_eq!(diff.removed, BTreeSet::from(["1".to_string()]));
    }

    #[test]
    fn test_set_diff_ignores_order() {
        let old = ids(&["3", "1", "2"]);
        let new = ids(&["4", "3", "2"]);
        let diff = set_diff(&old, &new);
        assert_eq!(diff.added.len(), 1);
        assert!(diff.added.contains("4"));
        assert!(diff.removed.contains("1"));
    }

    #[test]
    fn test_set_diff_ignores_duplicates() {
        let old = ids(&["1", "1", "2"]);
        let new = ids(&["2", "2", "1"]);
        assert!(set_diff(&old, &new).is_empty());
    }

    #[test]
    fn test_set_diff_empty_inputs() {
        let empty: Vec<String> = Vec::new();
        assert!(set_diff(&empty, &empty).is_empty());

        let some = ids(&["1"]);
        let diff = set_diff(&empty, &some);
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());
    }

    struct Record {
        name: String,
        size: u32,
        flag: bool,
    }

    const RECORD_FIELDS: &[Field<Record>] = &[
        ("name", |r: &Record| json!(r.name)),
        ("size", |r: &Record| json!(r.size)),
        ("flag", |r: &Record| json!(r.flag)),
    ];

    #[test]
    fn test_field_diff_reports_changed_fields_only() {
        let old = Record {
            name: "a".into(),
            size: 1,
            flag: true,
        };
        let new = Record {
            name: "b".into(),
            size: 1,
            flag: false,
        };
        let changes = field_diff(&old, &new, RECORD_FIELDS);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, "name");
        assert_eq!(changes[0].old, json!("a"));
        assert_eq!(changes[0].new, json!("b"));
        assert_eq!(changes[1].field, "flag");
    }

    #[test]
    fn test_field_diff_identical_records() {
        let a = Record {
            name: "same".into(),
            size: 7,
            flag: false,
        };
        let b = Record {
            name: "same".into(),
            size: 7,
            flag: false,
        };
        assert!(field_diff(&a, &b, RECORD_FIELDS).is_empty());
    }

    #[test]
    fn test_field_diff_no_selectors() {
        let a = Record {
            name: "x".into(),
            size: 1,
            flag: true,
        };
        let b = Record {
            name: "y".into(),
            size: 2,
            flag: false,
        };
        assert!(field_diff(&a, &b, &[]).is_empty());
    }
}
