//! One reconciler per managed child kind. Each builds its desired state,
//! binds the parent as controller, merges the common labels and applies the
//! kind-specific fields through the conflict-safe mutator.
use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, instrument};

use crate::crd::Racecourse;
use crate::desired::{self, WorkloadTemplate};
use crate::error::Result;
use crate::labels::CommonLabels;
use crate::mutator::{create_or_update, set_controller_reference, OperationResult, RetryPolicy};
use crate::store::ObjectStore;
use crate::telemetry::CHILD_WRITES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Deployment,
    Service,
    Ingress,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Ingress => "Ingress",
        }
    }

    /// Condition reason recorded when this child fails to converge.
    pub fn failure_reason(&self) -> String {
        format!("{}ReconcileFailed", self.as_str())
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Inputs shared by every child reconciler for the lifetime of the operator.
#[derive(Debug, Clone, Default)]
pub struct ChildContext {
    pub labels: CommonLabels,
    pub template: WorkloadTemplate,
    pub retry: RetryPolicy,
}

/// A child kind whose full shape derives from a [`Racecourse`].
pub trait ManagedChild:
    Resource<DynamicType = ()> + Default + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ChildKind;
    type Desired: Send + Sync;

    fn desired(parent: &Racecourse, ctx: &ChildContext) -> Self::Desired;

    /// Enforce every managed field of `desired` while keeping fields the
    /// server or other actors populated.
    fn apply_desired(&mut self, desired: &Self::Desired);
}

impl ManagedChild for Deployment {
    const KIND: ChildKind = ChildKind::Deployment;
    type Desired = DeploymentSpec;

    fn desired(parent: &Racecourse, ctx: &ChildContext) -> DeploymentSpec {
        desired::deployment_spec(&parent.spec, &ctx.template, &ctx.labels)
    }

    fn apply_desired(&mut self, desired: &DeploymentSpec) {
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.replicas = desired.replicas;
        spec.selector = desired.selector.clone();

        let tmpl = &mut spec.template;
        let want_meta = desired.template.metadata.clone().unwrap_or_default();
        let meta = tmpl.metadata.get_or_insert_with(Default::default);
        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.extend(want_meta.labels.unwrap_or_default());

        let want_pod = desired.template.spec.clone().unwrap_or_default();
        let pod = tmpl.spec.get_or_insert_with(Default::default);
        let mut containers = Vec::with_capacity(want_pod.containers.len());
        for want in want_pod.containers {
            let mut current = pod
                .containers
                .iter()
                .find(|c| c.name == want.name)
                .cloned()
                .unwrap_or_else(|| Container { name: want.name.clone(), ..Default::default() });
            current.image = want.image;
            current.image_pull_policy = want.image_pull_policy;
            current.ports = want.ports.map(|ports| merge_container_ports(current.ports.as_deref(), ports));
            containers.push(current);
        }
        pod.containers = containers;
    }
}

impl ManagedChild for Service {
    const KIND: ChildKind = ChildKind::Service;
    type Desired = ServiceSpec;

    fn desired(_parent: &Racecourse, ctx: &ChildContext) -> ServiceSpec {
        desired::service_spec(&ctx.template, &ctx.labels)
    }

    fn apply_desired(&mut self, desired: &ServiceSpec) {
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.selector = desired.selector.clone();
        spec.ports = desired.ports.clone().map(|ports| merge_service_ports(spec.ports.as_deref(), ports));
    }
}

impl ManagedChild for Ingress {
    const KIND: ChildKind = ChildKind::Ingress;
    type Desired = IngressSpec;

    fn desired(parent: &Racecourse, ctx: &ChildContext) -> IngressSpec {
        desired::ingress_spec(&parent.spec, &parent.name_any(), &ctx.template)
    }

    fn apply_desired(&mut self, desired: &IngressSpec) {
        let spec = self.spec.get_or_insert_with(Default::default);
        spec.rules = desired.rules.clone();
    }
}

// Ports are matched by their symbolic name so server defaults such as the
// protocol survive while numbers are enforced.
fn merge_container_ports(current: Option<&[ContainerPort]>, wanted: Vec<ContainerPort>) -> Vec<ContainerPort> {
    wanted
        .into_iter()
        .map(|want| match current.unwrap_or_default().iter().find(|p| p.name == want.name) {
            Some(existing) => ContainerPort { container_port: want.container_port, ..existing.clone() },
            None => want,
        })
        .collect()
}

fn merge_service_ports(current: Option<&[ServicePort]>, wanted: Vec<ServicePort>) -> Vec<ServicePort> {
    wanted
        .into_iter()
        .map(|want| match current.unwrap_or_default().iter().find(|p| p.name == want.name) {
            Some(existing) => ServicePort { port: want.port, target_port: want.target_port, ..existing.clone() },
            None => want,
        })
        .collect()
}

/// Converge the child of kind `K` that shares the parent's identity.
#[instrument(skip_all, fields(kind = %K::KIND, name = %parent.name_any()))]
pub async fn reconcile_child<K, S>(store: &S, ctx: &ChildContext, parent: &Racecourse) -> Result<(K, OperationResult)>
where
    K: ManagedChild,
    S: ObjectStore<K> + ?Sized,
{
    let namespace = parent.namespace().unwrap_or_default();
    let name = parent.name_any();
    let desired = K::desired(parent, ctx);
    let (obj, op) = create_or_update(store, &ctx.retry, &namespace, &name, |child: &mut K| {
        set_controller_reference(parent, child)?;
        ctx.labels.merge_into(&mut child.meta_mut().labels);
        child.apply_desired(&desired);
        Ok(())
    })
    .await?;
    CHILD_WRITES.with_label_values(&[K::KIND.as_str(), op.as_str()]).inc();
    if op != OperationResult::Unchanged {
        info!(op = %op, "child converged");
    }
    Ok((obj, op))
}
