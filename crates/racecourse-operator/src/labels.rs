//! The label contract shared by every managed child and the selector string
//! published on the parent status.
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const NAME_VALUE: &str = "racecourse";

/// Fixed label set identifying the managed workload family. Used both as the
/// create-time label on every child and as the pod selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonLabels(BTreeMap<String, String>);

impl Default for CommonLabels {
    fn default() -> Self {
        Self(BTreeMap::from([(NAME_LABEL.to_string(), NAME_VALUE.to_string())]))
    }
}

impl CommonLabels {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }

    pub fn selector(&self) -> LabelSelector {
        LabelSelector { match_labels: Some(self.to_map()), match_expressions: None }
    }

    /// Merge the common pairs into `labels`, leaving every other key untouched.
    pub fn merge_into(&self, labels: &mut Option<BTreeMap<String, String>>) {
        let labels = labels.get_or_insert_with(BTreeMap::new);
        for (k, v) in &self.0 {
            labels.insert(k.clone(), v.clone());
        }
    }
}

/// Render a label selector the way the API server's scale subresource expects
/// it: requirements sorted by key, joined by commas, `<none>` when empty.
pub fn format_label_selector(selector: Option<&LabelSelector>) -> String {
    let Some(selector) = selector else { return "<none>".into() };
    let mut reqs: Vec<(String, String)> = Vec::new();
    for (k, v) in selector.match_labels.iter().flatten() {
        reqs.push((k.clone(), format!("{k}={v}")));
    }
    for expr in selector.match_expressions.iter().flatten() {
        let mut values = expr.values.clone().unwrap_or_default();
        values.sort();
        values.dedup();
        let key = &expr.key;
        let rendered = match expr.operator.as_str() {
            "In" => format!("{key} in ({})", values.join(",")),
            "NotIn" => format!("{key} notin ({})", values.join(",")),
            "Exists" => key.clone(),
            "DoesNotExist" => format!("!{key}"),
            other => format!("{key} {other} ({})", values.join(",")),
        };
        reqs.push((key.clone(), rendered));
    }
    if reqs.is_empty() {
        return "<none>".into();
    }
    reqs.sort();
    reqs.into_iter().map(|(_, r)| r).collect::<Vec<_>>().join(",")
}
