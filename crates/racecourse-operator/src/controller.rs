//! Reconciliation entry point for `Racecourse` resources.
//!
//! A pass fetches the parent, seeds the `Available` condition on first sight,
//! then converges the Deployment, Service and Ingress in that order. The
//! first child failure flips `Available` to `False` and aborts the pass; the
//! scheduler backs off and redelivers. A clean pass requeues after a fixed
//! interval so out-of-band drift on the children gets repaired.
use std::{sync::Arc, time::Instant};

use futures_util::StreamExt;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service, networking::v1::Ingress};
use kube::{Api, Client, ResourceExt};
use kube_runtime::{controller::Action, watcher, Controller};
use tracing::{error, info, instrument, warn};

use crate::children::{reconcile_child, ChildContext, ChildKind, ManagedChild};
use crate::conditions::{self, ConditionStatus, ConditionUpdate, AVAILABLE, REASON_RECONCILING};
use crate::config::OperatorConfig;
use crate::crd::Racecourse;
use crate::desired::WorkloadTemplate;
use crate::error::{Error, Result};
use crate::labels::{format_label_selector, CommonLabels};
use crate::store::{ClusterStore, KubeStore, ObjectStore};
use crate::telemetry::{RECONCILES, RECONCILE_DURATION};

/// Shared state handed to every reconcile pass.
pub struct Context {
    pub store: Arc<dyn ClusterStore>,
    pub children: ChildContext,
    pub config: Arc<OperatorConfig>,
}

impl Context {
    pub fn new(store: Arc<dyn ClusterStore>, config: OperatorConfig) -> Self {
        let children = ChildContext {
            labels: CommonLabels::default(),
            template: WorkloadTemplate::from(&config),
            retry: config.retry_policy(),
        };
        Self { store, children, config: Arc::new(config) }
    }
}

/// Converge the racecourse identified by `namespace/name`.
#[instrument(skip(ctx))]
pub async fn reconcile_racecourse(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let store = &*ctx.store;
    let Some(mut parent) = ObjectStore::<Racecourse>::get(store, namespace, name).await? else {
        info!("Racecourse resource not found");
        return Ok(Action::await_change());
    };

    if parent.status.as_ref().map_or(true, |s| s.conditions.is_empty()) {
        let starting = ConditionUpdate::new(AVAILABLE, ConditionStatus::Unknown, REASON_RECONCILING, "Starting reconciliation")
            .observed_generation(parent.metadata.generation);
        if conditions::record_condition(store, &ctx.children.retry, namespace, name, &starting).await?.is_none() {
            return Ok(Action::await_change());
        }
        parent = match ObjectStore::<Racecourse>::get(store, namespace, name).await? {
            Some(p) => p,
            None => return Ok(Action::await_change()),
        };
    }

    let deployment: Deployment = converge(ctx, &parent).await?;
    let observed = deployment.status.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let selector = format_label_selector(deployment.spec.as_ref().map(|s| &s.selector));
    conditions::update_status(store, &ctx.children.retry, namespace, name, |status| {
        status.replicas = observed;
        status.selector = selector.clone();
    })
    .await?;

    let _: Service = converge(ctx, &parent).await?;
    let _: Ingress = converge(ctx, &parent).await?;

    let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let available = ConditionUpdate::new(
        AVAILABLE,
        ConditionStatus::True,
        REASON_RECONCILING,
        format!("Deployment for custom resource ({name}) with {replicas} replicas reconciled successfully"),
    )
    .observed_generation(parent.metadata.generation);
    conditions::record_condition(store, &ctx.children.retry, namespace, name, &available).await?;

    Ok(Action::requeue(ctx.config.requeue_after()))
}

/// Run one child reconciler; on failure record `Available=False` naming the
/// child before handing the error back.
async fn converge<K>(ctx: &Context, parent: &Racecourse) -> Result<K>
where
    K: ManagedChild,
    dyn ClusterStore: ObjectStore<K>,
{
    match reconcile_child::<K, dyn ClusterStore>(&*ctx.store, &ctx.children, parent).await {
        Ok((obj, _)) => Ok(obj),
        Err(cause) => Err(record_failure(ctx, parent, K::KIND, cause).await),
    }
}

async fn record_failure(ctx: &Context, parent: &Racecourse, child: ChildKind, cause: Error) -> Error {
    error!(kind = %child, error = %cause, "Failed to reconcile child");
    let name = parent.name_any();
    let namespace = parent.namespace().unwrap_or_default();
    let failed = ConditionUpdate::new(
        AVAILABLE,
        ConditionStatus::False,
        child.failure_reason(),
        format!("Failed to reconcile {child} for the custom resource ({name}): ({cause})"),
    )
    .observed_generation(parent.metadata.generation);
    match conditions::record_condition(&*ctx.store, &ctx.children.retry, &namespace, &name, &failed).await {
        Ok(_) => Error::Child { child, source: Box::new(cause) },
        Err(status) => {
            warn!(error = %status, "Failed to update Racecourse status");
            Error::StatusAfterFailure { child, cause: Box::new(cause), status: Box::new(status) }
        }
    }
}

/// kube-runtime entry point: bounds the pass by the configured deadline and
/// records metrics.
pub async fn reconcile(obj: Arc<Racecourse>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let deadline = ctx.config.reconcile_timeout();
    let result = match tokio::time::timeout(deadline, reconcile_racecourse(&ctx, &namespace, &name)).await {
        Ok(r) => r,
        Err(_) => Err(Error::DeadlineExceeded(deadline)),
    };
    let outcome = match &result { Ok(_) => "success", Err(e) => e.metric_label() };
    RECONCILES.with_label_values(&[outcome]).inc();
    RECONCILE_DURATION.with_label_values(&[outcome]).observe(start.elapsed().as_secs_f64());
    result
}

pub fn error_policy(obj: Arc<Racecourse>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(name = %obj.name_any(), namespace = ?obj.namespace(), error = %error, "reconcile failed, backing off");
    Action::requeue(ctx.config.error_requeue())
}

/// Watch racecourses and the children they own until shutdown.
pub async fn run(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let (parents, deployments, services, ingresses) = match config.namespace.as_deref() {
        Some(ns) => (
            Api::<Racecourse>::namespaced(client.clone(), ns),
            Api::<Deployment>::namespaced(client.clone(), ns),
            Api::<Service>::namespaced(client.clone(), ns),
            Api::<Ingress>::namespaced(client.clone(), ns),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone()), Api::all(client.clone()), Api::all(client.clone())),
    };
    if let Err(e) = parents.list(&Default::default()).await {
        error!(error = %e, "Racecourse CRD is not queryable; is it installed?");
        return Err(e.into());
    }
    info!(namespace = ?config.namespace, "starting racecourse controller");
    let store = Arc::new(KubeStore::new(client, config.field_manager.clone()));
    let ctx = Arc::new(Context::new(store, config));
    Controller::new(parents, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .owns(ingresses, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::debug!(object = %obj.name, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile dispatch failed"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
