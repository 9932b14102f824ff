//! Remote payload shapes.
//!
//! List endpoints are fetched as raw `serde_json::Value`s so that one
//! malformed record can be rejected on its own; these structs are what a
//! single record decodes into.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One page from the document listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentPage {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Query parameters for the document listing endpoint.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub q: Option<String>,
    pub owner_type: u8,
    pub sort_column: String,
    pub sort_order: String,
    pub offset: u32,
    pub limit: u32,
}

impl Default for DocumentQuery {
    fn default() -> Self {
        Self {
            q: None,
            owner_type: 0,
            sort_column: "name".to_string(),
            sort_order: "asc".to_string(),
            offset: 0,
            limit: 20,
        }
    }
}

impl DocumentQuery {
    /// Query pairs in the order they are appended to the URL.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(6);
        if let Some(q) = &self.q {
            pairs.push(("q", q.clone()));
        }
        pairs.push(("ownerType", self.owner_type.to_string()));
        pairs.push(("sortColumn", self.sort_column.clone()));
        pairs.push(("sortOrder", self.sort_order.clone()));
        pairs.push(("offset", self.offset.to_string()));
        pairs.push(("limit", self.limit.to_string()));
        pairs
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteOwner {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Document detail.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub owner: Option<RemoteOwner>,
    #[serde(default)]
    pub public: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWorkspace {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub is_main: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteElement {
    pub id: String,
    pub name: Option<String>,
    pub element_type: Option<String>,
    pub data_type: Option<String>,
    pub thumbnail_id: Option<String>,
}

/// A part, plus the outcome of its mass-properties sub-fetch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePart {
    pub part_id: String,
    pub name: Option<String>,
    pub state: Option<String>,
    pub body_type: Option<String>,
    pub material_properties: Option<Value>,
    pub appearance: Option<Value>,
    /// `None` until a fetch has been attempted; an unattempted fetch leaves
    /// the stored value alone.
    #[serde(skip)]
    pub mass_properties: Option<BestEffort<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFeature {
    pub feature_id: String,
    pub name: Option<String>,
    pub feature_type: Option<String>,
    #[serde(default)]
    pub suppressed: Option<bool>,
    pub parameters: Option<Value>,
}

/// Envelope of the feature listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeatureList {
    #[serde(default)]
    pub features: Vec<Value>,
}

/// The authenticated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Result of an optional secondary fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum BestEffort<T> {
    Fetched(T),
    /// The remote has nothing for this record.
    Absent,
    /// The fetch failed for some other reason.
    Failed(String),
}

impl<T> BestEffort<T> {
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Length units accepted by the STL export endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportUnits {
    #[default]
    Meter,
    Millimeter,
    Centimeter,
    Inch,
    Foot,
    Yard,
}

impl ExportUnits {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Meter => "meter",
            Self::Millimeter => "millimeter",
            Self::Centimeter => "centimeter",
            Self::Inch => "inch",
            Self::Foot => "foot",
            Self::Yard => "yard",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_query_pairs_skip_missing_q() {
        let pairs = DocumentQuery { limit: 100, ..DocumentQuery::default() }.to_pairs();
        assert_eq!(pairs[0], ("ownerType", "0".to_string()));
        assert!(pairs.iter().all(|(k, _)| *k != "q"));
        assert_eq!(pairs.last().unwrap(), &("limit", "100".to_string()));
    }

    #[test]
    fn test_part_decodes_camel_case() {
        let part: RemotePart = serde_json::from_value(json!({
            "partId": "JHD",
            "name": "Bracket",
            "bodyType": "solid",
            "materialProperties": {"name": "Steel"},
            "unknownField": 1
        }))
        .unwrap();

        assert_eq!(part.part_id, "JHD");
        assert_eq!(part.body_type.as_deref(), Some("solid"));
        assert!(part.mass_properties.is_none());
    }

    #[test]
    fn test_document_page_tolerates_missing_fields() {
        let page: DocumentPage = serde_json::from_value(json!({})).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next.is_none());
    }
}
