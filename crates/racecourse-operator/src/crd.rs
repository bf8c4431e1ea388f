use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired deployment topology of a racecourse web app.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[kube(
    group = "webapp.my.domain",
    version = "v1alpha1",
    kind = "Racecourse",
    plural = "racecourses",
    namespaced,
    status = "RacecourseStatus",
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"IngressHost","type":"string","jsonPath":".spec.ingressHost"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RacecourseSpec {
    /// Number of replicas in the deployment. Absent means zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Host used by the ingress rule. Absent matches every host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host: Option<String>,
}

impl RacecourseSpec {
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(0)
    }

    pub fn ingress_host(&self) -> &str {
        self.ingress_host.as_deref().unwrap_or("")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
pub struct RacecourseStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Mirrors the replica count reported by the owned Deployment.
    #[serde(default)]
    pub replicas: i32,
    /// Serialized label selector of the owned pods, read by the scale subresource.
    #[serde(default)]
    pub selector: String,
}

pub use RacecourseSpec as Spec;
pub use RacecourseStatus as Status;
