//! Status condition bookkeeping for a racecourse.
//!
//! Conditions are an ordered set keyed by `type`. Upserting a condition only
//! moves `lastTransitionTime` when its `status` actually changes; a new reason
//! or message on its own leaves the timestamp alone. Every ledger change is
//! persisted through the status subresource with its own conflict retry,
//! re-reading the parent on each attempt.
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use tracing::{debug, instrument};

use crate::crd::{Racecourse, RacecourseStatus};
use crate::error::Result;
use crate::mutator::{retry_on_conflict, RetryPolicy};
use crate::store::ObjectStore;

/// Overall convergence of the managed children.
pub const AVAILABLE: &str = "Available";
pub const REASON_RECONCILING: &str = "Reconciling";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

/// A condition update before it is stamped into the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionUpdate {
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: Option<i64>,
}

impl ConditionUpdate {
    pub fn new(type_: &str, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { type_: type_.into(), status, reason: reason.into(), message: message.into(), observed_generation: None }
    }

    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Upsert `update` by type. Returns `true` when the ledger changed.
pub fn set_condition(conditions: &mut Vec<Condition>, update: &ConditionUpdate, now: DateTime<Utc>) -> bool {
    let status = update.status.as_str();
    match conditions.iter_mut().find(|c| c.type_ == update.type_) {
        None => {
            conditions.push(Condition {
                type_: update.type_.clone(),
                status: status.into(),
                reason: update.reason.clone(),
                message: update.message.clone(),
                observed_generation: update.observed_generation,
                last_transition_time: Time(now),
            });
            true
        }
        Some(existing) => {
            let mut changed = false;
            if existing.status != status {
                existing.status = status.into();
                existing.last_transition_time = Time(now);
                changed = true;
            }
            if existing.reason != update.reason {
                existing.reason = update.reason.clone();
                changed = true;
            }
            if existing.message != update.message {
                existing.message = update.message.clone();
                changed = true;
            }
            if existing.observed_generation != update.observed_generation {
                existing.observed_generation = update.observed_generation;
                changed = true;
            }
            changed
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True.as_str())
}

/// Re-read the parent, apply `mutate` to its status and persist the result
/// when it differs. Conflicts restart from the re-read. Returns the latest
/// parent, or `None` if it disappeared meanwhile.
#[instrument(skip(store, policy, mutate))]
pub async fn update_status<S, F>(
    store: &S,
    policy: &RetryPolicy,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<Option<Racecourse>>
where
    S: ObjectStore<Racecourse> + ?Sized,
    F: Fn(&mut RacecourseStatus) + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(policy, move || async move {
        let Some(mut parent) = store.get(namespace, name).await? else {
            debug!("racecourse gone, skipping status write");
            return Ok(None);
        };
        let before = parent.status.clone().unwrap_or_default();
        let mut after = before.clone();
        mutate(&mut after);
        if parent.status.is_some() && after == before {
            return Ok(Some(parent));
        }
        parent.status = Some(after);
        let written = store.replace_status(&parent).await?;
        debug!(rv = ?written.resource_version(), "status written");
        Ok(Some(written))
    })
    .await
}

/// Stamp `update` onto the parent's condition ledger and persist it.
pub async fn record_condition<S>(
    store: &S,
    policy: &RetryPolicy,
    namespace: &str,
    name: &str,
    update: &ConditionUpdate,
) -> Result<Option<Racecourse>>
where
    S: ObjectStore<Racecourse> + ?Sized,
{
    let now = Utc::now();
    update_status(store, policy, namespace, name, |status| {
        set_condition(&mut status.conditions, update, now);
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn available(status: ConditionStatus, reason: &str, message: &str) -> ConditionUpdate {
        ConditionUpdate::new(AVAILABLE, status, reason, message)
    }

    #[test]
    fn timestamp_moves_only_on_status_change() {
        let mut conds = Vec::new();
        assert!(set_condition(&mut conds, &available(ConditionStatus::Unknown, REASON_RECONCILING, "Starting reconciliation"), t(0)));
        assert_eq!(conds[0].last_transition_time, Time(t(0)));

        assert!(set_condition(&mut conds, &available(ConditionStatus::Unknown, "Other", "new words"), t(10)));
        assert_eq!(conds[0].last_transition_time, Time(t(0)));
        assert_eq!(conds[0].message, "new words");

        assert!(set_condition(&mut conds, &available(ConditionStatus::True, REASON_RECONCILING, "ok"), t(20)));
        assert_eq!(conds[0].last_transition_time, Time(t(20)));
        assert_eq!(conds.len(), 1);
    }

    #[test]
    fn identical_update_is_not_a_change() {
        let mut conds = Vec::new();
        let upd = available(ConditionStatus::True, REASON_RECONCILING, "ok").observed_generation(Some(2));
        set_condition(&mut conds, &upd, t(0));
        assert!(!set_condition(&mut conds, &upd, t(30)));
        assert_eq!(conds[0].last_transition_time, Time(t(0)));
        assert_eq!(conds[0].observed_generation, Some(2));
    }

    #[test]
    fn types_are_kept_in_insertion_order() {
        let mut conds = Vec::new();
        set_condition(&mut conds, &ConditionUpdate::new("Progressing", ConditionStatus::True, "A", "a"), t(0));
        set_condition(&mut conds, &available(ConditionStatus::False, "B", "b"), t(0));
        set_condition(&mut conds, &ConditionUpdate::new("Progressing", ConditionStatus::False, "C", "c"), t(5));
        let types: Vec<_> = conds.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, ["Progressing", AVAILABLE]);
        assert!(!is_condition_true(&conds, AVAILABLE));
        assert_eq!(find_condition(&conds, "Progressing").unwrap().reason, "C");
    }
}
