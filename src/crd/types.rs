//! Supporting types for the Provisioner CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Consolidation policy for a provisioner's nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationSpec {
    /// When true, the consolidation sub-reconcilers may delete or replace
    /// this provisioner's nodes to reduce cost
    #[serde(default)]
    pub enabled: bool,
}

/// Operator of a scheduling requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RequirementOperator {
    /// Value must be one of the listed values
    In,
    /// Value must not be one of the listed values
    NotIn,
    /// The key must be present, values ignored
    Exists,
    /// The key must be absent, values ignored
    DoesNotExist,
}

/// A scheduling requirement constraining the nodes a provisioner may own,
/// e.g. the allowed capacity types or zones.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Label key the requirement applies to
    pub key: String,

    /// How the values are interpreted
    pub operator: RequirementOperator,

    /// Values for In/NotIn operators
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    /// Whether a label value satisfies this requirement.
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self.operator {
            RequirementOperator::In => value.is_some_and(|v| self.values.iter().any(|x| x == v)),
            RequirementOperator::NotIn => {
                value.is_none_or(|v| !self.values.iter().any(|x| x == v))
            }
            RequirementOperator::Exists => value.is_some(),
            RequirementOperator::DoesNotExist => value.is_none(),
        }
    }
}
