use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::{
    helpers::RequireLabels,
    spec::{Spec, SpecError},
    CLUSTER_NAME_LABEL, NODE_ALIASES_LABEL, SPEC_LABEL,
};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Missing '{}' label!", .0)]
    MissingLabel(String),
    #[error("Stored spec is invalid: {}", .0)]
    InvalidSpec(SpecError),
    #[error("Stored node aliases are invalid: {}", .0)]
    InvalidAliases(serde_json::Error),
    #[error("Label says the cluster is '{label}' but its spec says '{spec}'!")]
    NameMismatch { label: String, spec: String },
}

/// What a backend keeps about a cluster on its network (or instances), so the
/// cluster can be found again from another process.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMetadata {
    pub name: String,
    pub spec: Spec,
    pub node_aliases: BTreeMap<String, Vec<String>>,
}

impl ClusterMetadata {
    pub fn from_spec(spec: Spec) -> Result<Self, SpecError> {
        let cluster = spec.cluster()?;

        Ok(Self {
            name: cluster.name.clone(),
            node_aliases: cluster.node_aliases(),
            spec,
        })
    }

    pub fn to_labels(&self) -> HashMap<String, String> {
        let aliases = serde_json::to_string(&self.node_aliases).unwrap_or_else(|_| "{}".to_owned());

        HashMap::from([
            (CLUSTER_NAME_LABEL.to_owned(), self.name.clone()),
            (SPEC_LABEL.to_owned(), self.spec.to_json()),
            (NODE_ALIASES_LABEL.to_owned(), aliases),
        ])
    }

    /// Aliases fall back to the ones declared in the spec when the label is
    /// missing.
    pub fn from_labels(labels: &HashMap<String, String>) -> Result<Self, MetadataError> {
        let spec = labels.require_label_or_else(SPEC_LABEL, || {
            MetadataError::MissingLabel(SPEC_LABEL.to_owned())
        })?;
        let spec = Spec::from_json(spec).map_err(MetadataError::InvalidSpec)?;
        let mut metadata = Self::from_spec(spec).map_err(MetadataError::InvalidSpec)?;

        if let Some(name) = labels.get(CLUSTER_NAME_LABEL) {
            if *name != metadata.name {
                return Err(MetadataError::NameMismatch {
                    label: name.clone(),
                    spec: metadata.name,
                });
            }
        }

        if let Some(aliases) = labels.get(NODE_ALIASES_LABEL) {
            metadata.node_aliases =
                serde_json::from_str(aliases).map_err(MetadataError::InvalidAliases)?;
        }

        Ok(metadata)
    }

    pub fn is_managed(labels: &HashMap<String, String>) -> bool {
        labels.contains_key(SPEC_LABEL)
    }

    pub fn aliases_of(&self, hostname: &str) -> &[String] {
        self.node_aliases
            .get(hostname)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
