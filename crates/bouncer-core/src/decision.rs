//! Decisions as delivered by the threat-intelligence decision stream.

use serde::{Deserialize, Serialize};

/// A single allow/block decision about one value (an IP, a range, a country).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Scope of `value`, e.g. `"Ip"`, `"Range"`, `"Country"`. Compared
    /// case-insensitively.
    pub scope: String,
    /// The value the decision applies to.
    pub value: String,
    /// Remediation, e.g. `"ban"` or `"captcha"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    /// Remaining lifetime as reported upstream (e.g. `"3h59m"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl Decision {
    /// Create a decision with only the fields that drive matching.
    pub fn new(scope: impl Into<String>, value: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            value: value.into(),
            kind: kind.into(),
            id: None,
            origin: None,
            scenario: None,
            duration: None,
        }
    }
}

/// One pull from the decision stream: decisions to add and to remove.
///
/// The upstream API sends `null` instead of an empty list, so both fields
/// deserialize leniently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionBatch {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub new: Vec<Decision>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub deleted: Vec<Decision>,
}

impl DecisionBatch {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.deleted.is_empty()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Decision>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Decision>>::deserialize(deserializer)?.unwrap_or_default())
}
