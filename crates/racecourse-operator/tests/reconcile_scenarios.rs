use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service, networking::v1::Ingress};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use kube_runtime::controller::Action;
use racecourse_operator::children::ChildKind;
use racecourse_operator::conditions::{find_condition, AVAILABLE};
use racecourse_operator::config::RetryConfig;
use racecourse_operator::controller::{error_policy, reconcile};
use racecourse_operator::labels::{NAME_LABEL, NAME_VALUE};
use racecourse_operator::store::ObjectStore;
use racecourse_operator::telemetry::RECONCILES;
use racecourse_operator::test_support::{Fault, MemoryStore, WriteOp, WriteRecord};
use racecourse_operator::{reconcile_racecourse, Context, Error, OperatorConfig, Racecourse, RacecourseSpec};
use serde_json::json;

const NS: &str = "default";
const NAME: &str = "rc";

fn config() -> OperatorConfig {
    OperatorConfig { retry: RetryConfig { attempts: 3, initial_backoff_ms: 1, max_backoff_ms: 2 }, ..OperatorConfig::default() }
}

async fn setup(replicas: Option<i32>, host: Option<&str>) -> (Arc<MemoryStore>, Context) {
    let store = Arc::new(MemoryStore::new());
    let mut rc = Racecourse::new(NAME, RacecourseSpec { replicas, ingress_host: host.map(Into::into) });
    rc.metadata.namespace = Some(NS.into());
    ObjectStore::<Racecourse>::create(&*store, &rc).await.unwrap();
    store.clear_journal();
    let ctx = Context::new(store.clone(), config());
    (store, ctx)
}

async fn parent(store: &MemoryStore) -> Racecourse {
    ObjectStore::<Racecourse>::get(store, NS, NAME).await.unwrap().expect("racecourse")
}

async fn deployment(store: &MemoryStore) -> Option<Deployment> {
    ObjectStore::<Deployment>::get(store, NS, NAME).await.unwrap()
}

async fn service(store: &MemoryStore) -> Option<Service> {
    ObjectStore::<Service>::get(store, NS, NAME).await.unwrap()
}

async fn ingress(store: &MemoryStore) -> Option<Ingress> {
    ObjectStore::<Ingress>::get(store, NS, NAME).await.unwrap()
}

fn record(kind: &str, op: WriteOp) -> WriteRecord {
    WriteRecord { kind: kind.into(), name: NAME.into(), op }
}

#[tokio::test]
async fn fresh_racecourse_gets_all_children_and_available_true() {
    let (store, ctx) = setup(Some(3), None).await;
    let action = reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));

    let rc = parent(&store).await;
    let uid = rc.metadata.uid.clone().unwrap();

    let dep = deployment(&store).await.expect("deployment");
    let owners = dep.metadata.owner_references.clone().unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!((owners[0].uid.as_str(), owners[0].kind.as_str(), owners[0].controller), (uid.as_str(), "Racecourse", Some(true)));
    assert_eq!(dep.metadata.labels.as_ref().unwrap().get(NAME_LABEL).map(String::as_str), Some(NAME_VALUE));
    let spec = dep.spec.unwrap();
    assert_eq!(spec.replicas, Some(3));
    assert_eq!(spec.template.spec.unwrap().containers[0].image.as_deref(), Some("localhost/racecourse:latest"));

    let svc = service(&store).await.expect("service");
    assert_eq!(svc.metadata.owner_references.unwrap()[0].uid, uid);
    assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 3000);

    let ing = ingress(&store).await.expect("ingress");
    let rule = ing.spec.unwrap().rules.unwrap().remove(0);
    assert_eq!(rule.host, None);
    assert_eq!(rule.http.unwrap().paths[0].backend.service.as_ref().unwrap().name, NAME);

    let status = rc.status.unwrap();
    let available = find_condition(&status.conditions, AVAILABLE).unwrap();
    assert_eq!(available.status, "True");
    assert_eq!(available.reason, "Reconciling");
    assert_eq!(available.message, "Deployment for custom resource (rc) with 3 replicas reconciled successfully");
    assert_eq!(available.observed_generation, Some(1));
    assert_eq!(status.selector, "app.kubernetes.io/name=racecourse");
    assert_eq!(status.replicas, 0);
}

#[tokio::test]
async fn first_pass_seeds_unknown_before_touching_children() {
    let (store, ctx) = setup(Some(1), Some("race.example")).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    assert_eq!(
        store.journal(),
        [
            record("Racecourse", WriteOp::ReplaceStatus),
            record("Deployment", WriteOp::Create),
            record("Racecourse", WriteOp::ReplaceStatus),
            record("Service", WriteOp::Create),
            record("Ingress", WriteOp::Create),
            record("Racecourse", WriteOp::ReplaceStatus),
        ]
    );
    let rule = ingress(&store).await.unwrap().spec.unwrap().rules.unwrap().remove(0);
    assert_eq!(rule.host.as_deref(), Some("race.example"));
}

#[tokio::test]
async fn second_pass_writes_nothing() {
    let (store, ctx) = setup(Some(3), None).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    let first = parent(&store).await;
    store.clear_journal();

    let action = reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert!(store.journal().is_empty(), "unexpected writes: {:?}", store.journal());

    let second = parent(&store).await;
    let before = find_condition(&first.status.as_ref().unwrap().conditions, AVAILABLE).unwrap().last_transition_time.clone();
    let after = find_condition(&second.status.as_ref().unwrap().conditions, AVAILABLE).unwrap().last_transition_time.clone();
    assert_eq!(before, after);
}

#[tokio::test]
async fn replica_change_only_touches_deployment() {
    let (store, ctx) = setup(Some(3), None).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    let ltt = find_condition(&parent(&store).await.status.unwrap().conditions, AVAILABLE).unwrap().last_transition_time.clone();

    let mut rc = parent(&store).await;
    rc.spec.replicas = Some(5);
    ObjectStore::<Racecourse>::replace(&*store, &rc).await.unwrap();
    store.clear_journal();

    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    assert_eq!(deployment(&store).await.unwrap().spec.unwrap().replicas, Some(5));
    assert_eq!(store.writes("Deployment"), 1);
    assert_eq!(store.writes("Service"), 0);
    assert_eq!(store.writes("Ingress"), 0);

    let status = parent(&store).await.status.unwrap();
    let available = find_condition(&status.conditions, AVAILABLE).unwrap();
    assert_eq!(available.status, "True");
    assert_eq!(available.observed_generation, Some(2));
    assert!(available.message.contains("with 5 replicas"));
    assert_eq!(available.last_transition_time, ltt);
}

#[tokio::test]
async fn drift_is_repaired_and_foreign_labels_survive() {
    let (store, ctx) = setup(Some(3), None).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    store.edit("Deployment", NS, NAME, |d| {
        d["metadata"]["labels"]["team"] = json!("infra");
        d["spec"]["replicas"] = json!(9);
    });

    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    let dep = deployment(&store).await.unwrap();
    let labels = dep.metadata.labels.unwrap();
    assert_eq!(labels.get("team").map(String::as_str), Some("infra"));
    assert_eq!(labels.get(NAME_LABEL).map(String::as_str), Some(NAME_VALUE));
    assert_eq!(dep.spec.unwrap().replicas, Some(3));
}

#[tokio::test]
async fn conflicts_within_budget_are_absorbed() {
    let (store, ctx) = setup(Some(2), None).await;
    store.inject("Deployment", Fault::Conflict, 2);
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    assert!(deployment(&store).await.is_some());
    let status = parent(&store).await.status.unwrap();
    assert_eq!(find_condition(&status.conditions, AVAILABLE).unwrap().status, "True");
}

#[tokio::test]
async fn exhausted_conflicts_mark_unavailable() {
    let (store, ctx) = setup(Some(2), None).await;
    store.inject("Deployment", Fault::Conflict, 3);
    let err = reconcile_racecourse(&ctx, NS, NAME).await.unwrap_err();
    match err {
        Error::Child { child: ChildKind::Deployment, source } => {
            assert!(matches!(*source, Error::RetriesExhausted { attempts: 3, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(deployment(&store).await.is_none());
    assert!(service(&store).await.is_none());

    let status = parent(&store).await.status.unwrap();
    let available = find_condition(&status.conditions, AVAILABLE).unwrap();
    assert_eq!(available.status, "False");
    assert_eq!(available.reason, "DeploymentReconcileFailed");
    assert!(available.message.starts_with("Failed to reconcile Deployment for the custom resource (rc): ("));

    // next delivery recovers
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    let status = parent(&store).await.status.unwrap();
    assert_eq!(find_condition(&status.conditions, AVAILABLE).unwrap().status, "True");
}

#[tokio::test]
async fn service_failure_aborts_before_ingress() {
    let (store, ctx) = setup(Some(1), None).await;
    store.inject("Service", Fault::Unavailable, 1);
    let err = reconcile_racecourse(&ctx, NS, NAME).await.unwrap_err();
    assert_eq!(err.child(), Some(ChildKind::Service));
    assert!(deployment(&store).await.is_some());
    assert!(ingress(&store).await.is_none());

    let status = parent(&store).await.status.unwrap();
    let available = find_condition(&status.conditions, AVAILABLE).unwrap();
    assert_eq!(available.status, "False");
    assert_eq!(available.reason, "ServiceReconcileFailed");
}

#[tokio::test]
async fn failure_to_record_failure_reports_both() {
    let (store, ctx) = setup(Some(1), None).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    store.edit("Deployment", NS, NAME, |d| d["spec"]["replicas"] = json!(4));
    store.inject("Deployment", Fault::Unavailable, 1);
    store.inject("Racecourse", Fault::Unavailable, 1);
    let err = reconcile_racecourse(&ctx, NS, NAME).await.unwrap_err();
    assert!(matches!(err, Error::StatusAfterFailure { child: ChildKind::Deployment, .. }));
}

#[tokio::test]
async fn foreign_controller_is_not_adopted() {
    let (store, ctx) = setup(Some(1), None).await;
    let foreign = Deployment {
        metadata: ObjectMeta {
            name: Some(NAME.into()),
            namespace: Some(NS.into()),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".into(),
                kind: "ReplicaSet".into(),
                name: "someone-else".into(),
                uid: "uid-foreign".into(),
                controller: Some(true),
                block_owner_deletion: None,
            }]),
            ..Default::default()
        },
        ..Default::default()
    };
    ObjectStore::<Deployment>::create(&*store, &foreign).await.unwrap();

    let err = reconcile_racecourse(&ctx, NS, NAME).await.unwrap_err();
    assert_eq!(err.child(), Some(ChildKind::Deployment));
    let status = parent(&store).await.status.unwrap();
    assert_eq!(find_condition(&status.conditions, AVAILABLE).unwrap().reason, "DeploymentReconcileFailed");
}

#[tokio::test]
async fn status_mirrors_observed_deployment_replicas() {
    let (store, ctx) = setup(Some(3), None).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    store.set_status("Deployment", NS, NAME, json!({"replicas": 3, "readyReplicas": 3}));
    store.clear_journal();

    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    assert_eq!(parent(&store).await.status.unwrap().replicas, 3);
    assert_eq!(store.journal(), [record("Racecourse", WriteOp::ReplaceStatus)]);
}

#[tokio::test]
async fn missing_parent_is_a_quiet_no_op() {
    let store = Arc::new(MemoryStore::new());
    let ctx = Context::new(store.clone(), config());
    let action = reconcile_racecourse(&ctx, NS, "ghost").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(store.journal().is_empty());
}

#[tokio::test]
async fn deleting_parent_collects_children() {
    let (store, ctx) = setup(Some(2), None).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    store.delete("Racecourse", NS, NAME);
    for kind in ["Deployment", "Service", "Ingress"] {
        assert!(!store.contains(kind, NS, NAME), "{kind} survived its owner");
    }
    store.clear_journal();
    assert_eq!(reconcile_racecourse(&ctx, NS, NAME).await.unwrap(), Action::await_change());
    assert!(store.journal().is_empty());
}

#[tokio::test]
async fn runtime_entry_points() {
    let (store, ctx) = setup(Some(1), None).await;
    let ctx = Arc::new(ctx);
    let rc = Arc::new(parent(&store).await);
    assert_eq!(reconcile(rc.clone(), ctx.clone()).await.unwrap(), Action::requeue(Duration::from_secs(60)));
    let err = Error::Config("boom".into());
    assert_eq!(error_policy(rc, &err, ctx), Action::requeue(Duration::from_secs(5)));
}

#[tokio::test]
async fn status_conflicts_within_budget_are_absorbed() {
    let (store, ctx) = setup(Some(3), None).await;
    store.inject("Racecourse", Fault::Conflict, 2);
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    let status = parent(&store).await.status.unwrap();
    let available = find_condition(&status.conditions, AVAILABLE).unwrap();
    assert_eq!(available.status, "True");
    assert_eq!(available.message, "Deployment for custom resource (rc) with 3 replicas reconciled successfully");
}

#[tokio::test]
async fn exhausted_status_conflicts_abort_the_pass() {
    let (store, ctx) = setup(Some(3), None).await;
    store.inject("Racecourse", Fault::Conflict, 3);
    let err = reconcile_racecourse(&ctx, NS, NAME).await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }), "unexpected error: {err:?}");
    assert!(parent(&store).await.status.is_none());
    assert!(deployment(&store).await.is_none());
}

#[tokio::test]
async fn stale_status_write_rereads_and_keeps_foreign_conditions() {
    let (store, ctx) = setup(Some(2), None).await;
    store.race_next_write("Racecourse", |rc| {
        rc["status"]["conditions"] = json!([{
            "type": "Progressing",
            "status": "True",
            "reason": "External",
            "message": "set by another controller",
            "lastTransitionTime": "2024-01-01T00:00:00Z",
        }]);
    });
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();

    let status = parent(&store).await.status.unwrap();
    assert_eq!(find_condition(&status.conditions, "Progressing").unwrap().reason, "External");
    assert_eq!(find_condition(&status.conditions, AVAILABLE).unwrap().status, "True");
}

#[tokio::test]
async fn stale_child_write_is_recomputed_from_fresh_read() {
    let (store, ctx) = setup(Some(3), None).await;
    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    store.edit("Deployment", NS, NAME, |d| d["spec"]["replicas"] = json!(9));
    store.race_next_write("Deployment", |d| d["metadata"]["labels"]["team"] = json!("infra"));
    store.clear_journal();

    reconcile_racecourse(&ctx, NS, NAME).await.unwrap();
    let dep = deployment(&store).await.unwrap();
    assert_eq!(dep.metadata.labels.unwrap().get("team").map(String::as_str), Some("infra"));
    assert_eq!(dep.spec.unwrap().replicas, Some(3));
    assert_eq!(store.writes("Deployment"), 1);
}

/// Delegates to a [`MemoryStore`] but stalls every Service read.
struct SlowServiceReads {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl<K> ObjectStore<K> for SlowServiceReads
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
    MemoryStore: ObjectStore<K>,
{
    async fn get(&self, namespace: &str, name: &str) -> racecourse_operator::Result<Option<K>> {
        if K::kind(&()) == "Service" {
            tokio::time::sleep(self.delay).await;
        }
        ObjectStore::<K>::get(&*self.inner, namespace, name).await
    }

    async fn create(&self, obj: &K) -> racecourse_operator::Result<K> {
        ObjectStore::<K>::create(&*self.inner, obj).await
    }

    async fn replace(&self, obj: &K) -> racecourse_operator::Result<K> {
        ObjectStore::<K>::replace(&*self.inner, obj).await
    }

    async fn replace_status(&self, obj: &K) -> racecourse_operator::Result<K> {
        ObjectStore::<K>::replace_status(&*self.inner, obj).await
    }
}

#[tokio::test]
async fn deadline_aborts_pass_without_rollback() {
    let (store, _) = setup(Some(2), None).await;
    let slow = Arc::new(SlowServiceReads { inner: store.clone(), delay: Duration::from_secs(5) });
    let ctx = Arc::new(Context::new(slow, OperatorConfig { reconcile_timeout_secs: 1, ..config() }));
    let rc = Arc::new(parent(&store).await);
    let before = RECONCILES.with_label_values(&["deadline"]).get();

    let err = reconcile(rc, ctx).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded(d) if d == Duration::from_secs(1)), "unexpected error: {err:?}");
    assert_eq!(RECONCILES.with_label_values(&["deadline"]).get(), before + 1);

    // work done before the deadline stays in place
    assert!(deployment(&store).await.is_some());
    assert!(service(&store).await.is_none());
    let status = parent(&store).await.status.unwrap();
    assert_eq!(find_condition(&status.conditions, AVAILABLE).unwrap().status, "Unknown");
}
