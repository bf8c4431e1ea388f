//! Pure mapping from a racecourse spec to the target shape of each child.
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::OperatorConfig;
use crate::crd::RacecourseSpec;
use crate::labels::CommonLabels;

pub const INGRESS_PATH: &str = "/";
pub const INGRESS_PATH_TYPE: &str = "Prefix";

/// Fixed pod shape shared by every racecourse.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadTemplate {
    pub image: String,
    pub image_pull_policy: String,
    pub container_name: String,
    pub port_name: String,
    pub container_port: i32,
    pub service_port: i32,
}

impl From<&OperatorConfig> for WorkloadTemplate {
    fn from(cfg: &OperatorConfig) -> Self {
        Self {
            image: cfg.image.clone(),
            image_pull_policy: cfg.image_pull_policy.clone(),
            container_name: cfg.container_name.clone(),
            port_name: cfg.port_name.clone(),
            container_port: cfg.container_port,
            service_port: cfg.service_port,
        }
    }
}

impl Default for WorkloadTemplate {
    fn default() -> Self {
        Self::from(&OperatorConfig::default())
    }
}

pub fn deployment_spec(spec: &RacecourseSpec, template: &WorkloadTemplate, labels: &CommonLabels) -> DeploymentSpec {
    DeploymentSpec {
        replicas: Some(spec.desired_replicas()),
        selector: labels.selector(),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta { labels: Some(labels.to_map()), ..Default::default() }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: template.container_name.clone(),
                    image: Some(template.image.clone()),
                    image_pull_policy: Some(template.image_pull_policy.clone()),
                    ports: Some(vec![ContainerPort {
                        name: Some(template.port_name.clone()),
                        container_port: template.container_port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

pub fn service_spec(template: &WorkloadTemplate, labels: &CommonLabels) -> ServiceSpec {
    ServiceSpec {
        selector: Some(labels.to_map()),
        ports: Some(vec![ServicePort {
            name: Some(template.port_name.clone()),
            port: template.service_port,
            target_port: Some(IntOrString::String(template.port_name.clone())),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// One HTTP rule on the optional host forwarding `/` to the service named
/// `service_name` by symbolic port. An empty host matches every host.
pub fn ingress_spec(spec: &RacecourseSpec, service_name: &str, template: &WorkloadTemplate) -> IngressSpec {
    let host = spec.ingress_host();
    IngressSpec {
        rules: Some(vec![IngressRule {
            host: (!host.is_empty()).then(|| host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(INGRESS_PATH.into()),
                    path_type: INGRESS_PATH_TYPE.into(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: service_name.into(),
                            port: Some(ServiceBackendPort { name: Some(template.port_name.clone()), number: None }),
                        }),
                        resource: None,
                    },
                }],
            }),
        }]),
        ..Default::default()
    }
}
