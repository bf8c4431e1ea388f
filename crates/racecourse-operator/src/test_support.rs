//! In-memory object store for unit and integration tests.
//!
//! Mimics the API server semantics the reconciler depends on: resource
//! versions with optimistic concurrency on every write, a status subresource
//! versioned together with the object but written separately, uid and
//! generation assignment, and garbage collection of owned objects.
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ErrorResponse;
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Replace,
    ReplaceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: String,
    pub name: String,
    pub op: WriteOp,
}

/// Failure to hand out instead of performing the next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Conflict,
    Unavailable,
}

type Key = (String, String, String);
type RaceEdit = Box<dyn FnOnce(&mut Value) + Send>;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    version: u64,
    journal: Vec<WriteRecord>,
    faults: BTreeMap<String, VecDeque<Fault>>,
    races: BTreeMap<String, VecDeque<RaceEdit>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(Value::as_str)
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` writes against `kind` fail with `fault`.
    pub fn inject(&self, kind: &str, fault: Fault, count: usize) {
        let mut inner = self.lock();
        let queue = inner.faults.entry(kind.to_string()).or_default();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    /// Let another writer slip `f` in between the next read and version
    /// checked write of `kind`, so that write carries a stale resource
    /// version and gets rejected with a genuine conflict.
    pub fn race_next_write(&self, kind: &str, f: impl FnOnce(&mut Value) + Send + 'static) {
        self.lock().races.entry(kind.to_string()).or_default().push_back(Box::new(f));
    }

    pub fn journal(&self) -> Vec<WriteRecord> { self.lock().journal.clone() }

    pub fn clear_journal(&self) { self.lock().journal.clear(); }

    pub fn writes(&self, kind: &str) -> usize {
        self.lock().journal.iter().filter(|w| w.kind == kind).count()
    }

    pub fn contains(&self, kind: &str, namespace: &str, name: &str) -> bool {
        self.lock().objects.contains_key(&(kind.to_string(), namespace.to_string(), name.to_string()))
    }

    /// Overwrite `status` of a stored object, as another controller would.
    pub fn set_status(&self, kind: &str, namespace: &str, name: &str, status: Value) {
        let mut inner = self.lock();
        inner.version += 1;
        let rv = inner.version.to_string();
        if let Some(obj) = inner.objects.get_mut(&(kind.to_string(), namespace.to_string(), name.to_string())) {
            obj["status"] = status;
            obj["metadata"]["resourceVersion"] = Value::String(rv);
        }
    }

    /// Apply an out-of-band edit to a stored object.
    pub fn edit(&self, kind: &str, namespace: &str, name: &str, f: impl FnOnce(&mut Value)) {
        let mut inner = self.lock();
        inner.version += 1;
        let rv = inner.version.to_string();
        if let Some(obj) = inner.objects.get_mut(&(kind.to_string(), namespace.to_string(), name.to_string())) {
            f(obj);
            obj["metadata"]["resourceVersion"] = Value::String(rv);
        }
    }

    /// Delete an object and, like the garbage collector, everything that
    /// lists it in `ownerReferences`.
    pub fn delete(&self, kind: &str, namespace: &str, name: &str) {
        let mut inner = self.lock();
        let Some(obj) = inner.objects.remove(&(kind.to_string(), namespace.to_string(), name.to_string())) else { return };
        let Some(uid) = meta_str(&obj, "uid").map(str::to_string) else { return };
        let owned: Vec<Key> = inner
            .objects
            .iter()
            .filter(|(_, o)| {
                o.get("metadata")
                    .and_then(|m| m.get("ownerReferences"))
                    .and_then(|r| serde_json::from_value::<Vec<OwnerReference>>(r.clone()).ok())
                    .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in owned {
            inner.objects.remove(&k);
        }
    }

    fn take_fault(inner: &mut Inner, kind: &str) -> Option<Fault> {
        inner.faults.get_mut(kind).and_then(VecDeque::pop_front)
    }

    fn run_race(inner: &mut Inner, kind: &str, key: &Key) {
        let Some(edit) = inner.races.get_mut(kind).and_then(VecDeque::pop_front) else { return };
        inner.version += 1;
        let rv = inner.version.to_string();
        if let Some(obj) = inner.objects.get_mut(key) {
            edit(obj);
            obj["metadata"]["resourceVersion"] = Value::String(rv);
        }
    }
}

fn fault_error(fault: Fault, kind: &str, name: &str) -> Error {
    let (code, reason) = match fault {
        Fault::Conflict => (409, "Conflict"),
        Fault::Unavailable => (503, "ServiceUnavailable"),
    };
    let ae = ErrorResponse { status: "Failure".into(), message: format!("injected {reason}"), reason: reason.into(), code };
    Error::from_api(kube::Error::Api(ae), kind, name)
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let inner = self.lock();
        match inner.objects.get(&key::<K>(namespace, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut inner = self.lock();
        if let Some(fault) = Self::take_fault(&mut inner, &kind) {
            return Err(fault_error(fault, &kind, &name));
        }
        let k = key::<K>(&namespace, &name);
        if inner.objects.contains_key(&k) {
            return Err(Error::AlreadyExists { kind, name });
        }
        inner.version += 1;
        let version = inner.version;
        let mut value = serde_json::to_value(obj)?;
        value["metadata"]["resourceVersion"] = Value::String(version.to_string());
        value["metadata"]["uid"] = Value::String(format!("uid-{version}"));
        value["metadata"]["generation"] = Value::from(1);
        inner.objects.insert(k, value.clone());
        inner.journal.push(WriteRecord { kind, name, op: WriteOp::Create });
        Ok(serde_json::from_value(value)?)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut inner = self.lock();
        if let Some(fault) = Self::take_fault(&mut inner, &kind) {
            return Err(fault_error(fault, &kind, &name));
        }
        let k = key::<K>(&namespace, &name);
        Self::run_race(&mut inner, &kind, &k);
        let Some(current) = inner.objects.get(&k).cloned() else {
            return Err(fault_error(Fault::Conflict, &kind, &name));
        };
        if meta_str(&current, "resourceVersion") != obj.meta().resource_version.as_deref() {
            return Err(fault_error(Fault::Conflict, &kind, &name));
        }
        inner.version += 1;
        let version = inner.version;
        let mut value = serde_json::to_value(obj)?;
        // status belongs to the subresource and is not writable here
        match (current.get("status"), value.as_object_mut()) {
            (Some(status), Some(obj)) => { obj.insert("status".into(), status.clone()); }
            (None, Some(obj)) => { obj.remove("status"); }
            _ => {}
        }
        let spec_changed = value.get("spec") != current.get("spec");
        let generation = current["metadata"]["generation"].as_i64().unwrap_or(1) + i64::from(spec_changed);
        value["metadata"]["resourceVersion"] = Value::String(version.to_string());
        value["metadata"]["uid"] = current["metadata"]["uid"].clone();
        value["metadata"]["generation"] = Value::from(generation);
        inner.objects.insert(k, value.clone());
        inner.journal.push(WriteRecord { kind, name, op: WriteOp::Replace });
        Ok(serde_json::from_value(value)?)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let kind = K::kind(&()).to_string();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut inner = self.lock();
        if let Some(fault) = Self::take_fault(&mut inner, &kind) {
            return Err(fault_error(fault, &kind, &name));
        }
        let k = key::<K>(&namespace, &name);
        Self::run_race(&mut inner, &kind, &k);
        let Some(mut current) = inner.objects.get(&k).cloned() else {
            return Err(fault_error(Fault::Conflict, &kind, &name));
        };
        if meta_str(&current, "resourceVersion") != obj.meta().resource_version.as_deref() {
            return Err(fault_error(Fault::Conflict, &kind, &name));
        }
        inner.version += 1;
        let status = serde_json::to_value(obj)?.get("status").cloned().unwrap_or(Value::Null);
        current["status"] = status;
        current["metadata"]["resourceVersion"] = Value::String(inner.version.to_string());
        inner.objects.insert(k, current.clone());
        inner.journal.push(WriteRecord { kind, name, op: WriteOp::ReplaceStatus });
        Ok(serde_json::from_value(current)?)
    }
}
