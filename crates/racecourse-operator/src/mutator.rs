//! Read-modify-write with optimistic concurrency.
use std::{fmt, future::Future, time::Duration};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::ObjectStore;

/// Local micro-retry budget for version conflicts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, initial_backoff: Duration::from_millis(10), max_backoff: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry `attempt` (1-based), with up to a third of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)));
        let capped = exp.min(self.max_backoff);
        let jitter = fastrand::u64(..(capped.as_millis() as u64 / 3 + 1));
        capped + Duration::from_millis(jitter)
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the budget
/// runs out. Each attempt must redo the full fetch, mutate, write cycle.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_conflict() && attempt < policy.attempts => {
                let delay = policy.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "conflict, retrying");
                sleep(delay).await;
            }
            Err(e) if e.is_conflict() => {
                warn!(attempts = attempt, error = %e, "conflict retry budget exhausted");
                return Err(Error::RetriesExhausted { attempts: attempt, source: Box::new(e) });
            }
            other => return other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

impl OperationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for OperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Ensure the stored `namespace/name` reflects `mutate`, retrying on version
/// conflicts. `mutate` is recomputed on every attempt against the freshly
/// fetched object and must therefore be free of side effects. When the
/// mutation leaves the object untouched no write is issued.
pub async fn create_or_update<K, S, F>(
    store: &S,
    policy: &RetryPolicy,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<(K, OperationResult)>
where
    S: ObjectStore<K> + ?Sized,
    K: Resource<DynamicType = ()> + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    F: Fn(&mut K) -> Result<()> + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(policy, move || create_or_update_once(store, namespace, name, mutate)).await
}

async fn create_or_update_once<K, S, F>(store: &S, namespace: &str, name: &str, mutate: &F) -> Result<(K, OperationResult)>
where
    S: ObjectStore<K> + ?Sized,
    K: Resource<DynamicType = ()> + Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    F: Fn(&mut K) -> Result<()> + Sync,
{
    match store.get(namespace, name).await? {
        None => {
            let mut obj = K::default();
            *obj.meta_mut() = ObjectMeta { name: Some(name.into()), namespace: Some(namespace.into()), ..Default::default() };
            mutate(&mut obj)?;
            ensure_identity(&obj, namespace, name)?;
            let created = store.create(&obj).await?;
            Ok((created, OperationResult::Created))
        }
        Some(existing) => {
            let mut obj = existing.clone();
            mutate(&mut obj)?;
            ensure_identity(&obj, namespace, name)?;
            if serde_json::to_value(&existing)? == serde_json::to_value(&obj)? {
                return Ok((existing, OperationResult::Unchanged));
            }
            let updated = store.replace(&obj).await?;
            Ok((updated, OperationResult::Updated))
        }
    }
}

fn ensure_identity<K: Resource>(obj: &K, namespace: &str, name: &str) -> Result<()> {
    if obj.meta().name.as_deref() != Some(name) || obj.meta().namespace.as_deref() != Some(namespace) {
        return Err(Error::IdentityChanged { namespace: namespace.into(), name: name.into() });
    }
    Ok(())
}

/// Mark `owner` as the controller of `child`. An existing reference to the
/// same owner is refreshed in place; a different controller is an error.
pub fn set_controller_reference<O, K>(owner: &O, child: &mut K) -> Result<()>
where
    O: Resource<DynamicType = ()>,
    K: Resource<DynamicType = ()>,
{
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| Error::MissingOwnerUid(owner.name_any()))?;
    let child_name = child.name_any();
    let refs = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != owner_ref.uid) {
        return Err(Error::AlreadyOwned {
            kind: K::kind(&()).to_string(),
            name: child_name,
            owner: format!("{} {}", other.kind, other.name),
        });
    }
    match refs.iter_mut().find(|r| r.uid == owner_ref.uid) {
        Some(existing) => *existing = owner_ref,
        None => refs.push(owner_ref),
    }
    Ok(())
}
