//! Task dependencies: a set of prerequisite ids and how to combine them.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::error::SchedulerError;

/// Prerequisites of a task.
///
/// `all` requires every id to be satisfied (otherwise any one suffices).
/// `success` lets successful prerequisites satisfy the dependency and
/// `failure` lets failed ones do so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub ids: BTreeSet<Uuid>,
    pub all: bool,
    pub success: bool,
    pub failure: bool,
}

impl Default for Dependency {
    fn default() -> Self {
        Self {
            ids: BTreeSet::new(),
            all: true,
            success: true,
            failure: false,
        }
    }
}

impl Dependency {
    pub fn on(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    /// Parse a metadata value: absent, a list of ids, or
    /// `{ids, all, success, failure}`.
    pub fn from_value(value: Option<&Value>) -> Result<Self, SchedulerError> {
        let Some(value) = value else {
            return Ok(Self::default());
        };
        match value {
            Value::Null => Ok(Self::default()),
            Value::String(_) | Value::Array(_) => Ok(Self {
                ids: parse_ids(value)?,
                ..Self::default()
            }),
            Value::Object(map) => {
                let flag = |key: &str, default: bool| -> Result<bool, SchedulerError> {
                    match map.get(key) {
                        None | Some(Value::Null) => Ok(default),
                        Some(Value::Bool(b)) => Ok(*b),
                        Some(other) => Err(SchedulerError::InvalidDependency(format!(
                            "'{key}' must be a boolean, got {other}"
                        ))),
                    }
                };
                let dep = Self {
                    ids: match map.get("ids") {
                        Some(ids) => parse_ids(ids)?,
                        None => BTreeSet::new(),
                    },
                    all: flag("all", true)?,
                    success: flag("success", true)?,
                    failure: flag("failure", false)?,
                };
                if !dep.success && !dep.failure {
                    return Err(SchedulerError::InvalidDependency(
                        "at least one of 'success' and 'failure' must be true".into(),
                    ));
                }
                Ok(dep)
            }
            other => Err(SchedulerError::InvalidDependency(format!(
                "expected a list of task ids or an object, got {other}"
            ))),
        }
    }

    fn satisfying<'a>(&self, completed: &'a HashSet<Uuid>, failed: &'a HashSet<Uuid>) -> impl Fn(&Uuid) -> bool + 'a {
        let (success, failure) = (self.success, self.failure);
        move |id| (success && completed.contains(id)) || (failure && failed.contains(id))
    }

    fn blocking<'a>(&self, completed: &'a HashSet<Uuid>, failed: &'a HashSet<Uuid>) -> impl Fn(&Uuid) -> bool + 'a {
        let (success, failure) = (self.success, self.failure);
        move |id| (!success && completed.contains(id)) || (!failure && failed.contains(id))
    }

    /// Whether the finished sets satisfy this dependency. Empty is always met.
    pub fn check(&self, completed: &HashSet<Uuid>, failed: &HashSet<Uuid>) -> bool {
        if self.is_empty() {
            return true;
        }
        let ok = self.satisfying(completed, failed);
        if self.all {
            self.ids.iter().all(ok)
        } else {
            self.ids.iter().any(ok)
        }
    }

    /// Whether this dependency can no longer be met, whatever finishes next.
    pub fn unreachable(&self, completed: &HashSet<Uuid>, failed: &HashSet<Uuid>) -> bool {
        if self.is_empty() {
            return false;
        }
        let dead = self.blocking(completed, failed);
        if self.all {
            self.ids.iter().any(dead)
        } else {
            self.ids.iter().all(dead)
        }
    }

    /// Every prerequisite has finished, one way or the other.
    pub fn all_finished(&self, completed: &HashSet<Uuid>, failed: &HashSet<Uuid>) -> bool {
        self.ids
            .iter()
            .all(|id| completed.contains(id) || failed.contains(id))
    }
}

fn parse_ids(value: &Value) -> Result<BTreeSet<Uuid>, SchedulerError> {
    let parse_one = |v: &Value| -> Result<Uuid, SchedulerError> {
        let s = v.as_str().ok_or_else(|| {
            SchedulerError::InvalidDependency(format!("task id must be a string, got {v}"))
        })?;
        Uuid::parse_str(s)
            .map_err(|e| SchedulerError::InvalidDependency(format!("bad task id '{s}': {e}")))
    };
    match value {
        Value::String(_) => Ok(BTreeSet::from([parse_one(value)?])),
        Value::Array(items) => items.iter().map(parse_one).collect(),
        other => Err(SchedulerError::InvalidDependency(format!(
            "expected task ids, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn set(ids: &[Uuid]) -> HashSet<Uuid> {
        ids.iter().copied().collect()
    }

    #[test]
    fn list_form_defaults_to_all_success() {
        let [a, b] = [Uuid::new_v4(), Uuid::new_v4()];
        let dep = Dependency::from_value(Some(&json!([a.to_string(), b.to_string()]))).unwrap();
        assert!(dep.all && dep.success && !dep.failure);
        assert_eq!(dep.ids.len(), 2);
    }

    #[test]
    fn object_form_reads_flags() {
        let a = Uuid::new_v4();
        let dep = Dependency::from_value(Some(&json!({
            "ids": [a.to_string()], "all": false, "success": false, "failure": true
        })))
        .unwrap();
        assert!(!dep.all && !dep.success && dep.failure);
    }

    #[test]
    fn malformed_specs_are_rejected() {
        for bad in [
            json!(3),
            json!(["not-a-uuid"]),
            json!([1, 2]),
            json!({"ids": [], "all": "yes"}),
            json!({"ids": [], "success": false, "failure": false}),
        ] {
            assert!(
                matches!(Dependency::from_value(Some(&bad)), Err(SchedulerError::InvalidDependency(_))),
                "accepted {bad}"
            );
        }
    }

    #[test]
    fn absent_and_null_are_empty() {
        assert!(Dependency::from_value(None).unwrap().is_empty());
        assert!(Dependency::from_value(Some(&Value::Null)).unwrap().is_empty());
    }

    #[test]
    fn all_success_semantics() {
        let t = ids(2);
        let dep = Dependency::on(t.clone());
        assert!(!dep.check(&set(&t[..1]), &HashSet::new()));
        assert!(dep.check(&set(&t), &HashSet::new()));
        assert!(!dep.unreachable(&set(&t[..1]), &HashSet::new()));
        assert!(dep.unreachable(&set(&t[..1]), &set(&t[1..])));
    }

    #[test]
    fn any_semantics() {
        let t = ids(2);
        let dep = Dependency {
            all: false,
            ..Dependency::on(t.clone())
        };
        assert!(dep.check(&set(&t[1..]), &HashSet::new()));
        assert!(!dep.unreachable(&HashSet::new(), &set(&t[..1])));
        assert!(dep.unreachable(&HashSet::new(), &set(&t)));
    }

    #[test]
    fn failure_only_dependency_waits_for_failure() {
        let t = ids(1);
        let dep = Dependency {
            success: false,
            failure: true,
            ..Dependency::on(t.clone())
        };
        assert!(dep.check(&HashSet::new(), &set(&t)));
        assert!(dep.unreachable(&set(&t), &HashSet::new()));
    }

    #[test]
    fn empty_dependency_is_always_met() {
        let dep = Dependency::default();
        assert!(dep.check(&HashSet::new(), &HashSet::new()));
        assert!(!dep.unreachable(&HashSet::new(), &HashSet::new()));
    }
}
