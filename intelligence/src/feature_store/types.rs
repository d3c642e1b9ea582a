//! Wire types of the online feature-serving API (JSON mapping)

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single typed feature value, one of the serving API's value kinds
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Double(f64),
    Int64(i64),
    Bool(bool),
    String(String),
    DoubleArray(Vec<f64>),
    Int64Array(Vec<i64>),
    BoolArray(Vec<bool>),
    StringArray(Vec<String>),
    /// Base64 as sent on the wire
    Bytes(String),
    /// No kind set
    Empty,
}

impl FeatureValue {
    /// Numeric view used by the model: doubles as-is, int64 widened.
    /// Every other kind has no numeric value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Double(v) => Some(*v),
            FeatureValue::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// int64 travels as a decimal string in the JSON mapping; numbers are accepted too
#[derive(Debug, Clone, Copy, PartialEq)]
struct Int64(i64);

impl<'de> Deserialize<'de> for Int64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i64),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Int64(n)),
            Repr::Text(s) => s.trim().parse().map(Int64).map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for Int64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Values<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    double_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    int64_value: Option<Int64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bool_value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    double_array_value: Option<Values<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    int64_array_value: Option<Values<Int64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bool_array_value: Option<Values<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string_array_value: Option<Values<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bytes_value: Option<String>,
}

impl From<WireValue> for FeatureValue {
    fn from(wire: WireValue) -> Self {
        if let Some(v) = wire.double_value {
            FeatureValue::Double(v)
        } else if let Some(v) = wire.int64_value {
            FeatureValue::Int64(v.0)
        } else if let Some(v) = wire.bool_value {
            FeatureValue::Bool(v)
        } else if let Some(v) = wire.string_value {
            FeatureValue::String(v)
        } else if let Some(v) = wire.double_array_value {
            FeatureValue::DoubleArray(v.values)
        } else if let Some(v) = wire.int64_array_value {
            FeatureValue::Int64Array(v.values.into_iter().map(|i| i.0).collect())
        } else if let Some(v) = wire.bool_array_value {
            FeatureValue::BoolArray(v.values)
        } else if let Some(v) = wire.string_array_value {
            FeatureValue::StringArray(v.values)
        } else if let Some(v) = wire.bytes_value {
            FeatureValue::Bytes(v)
        } else {
            FeatureValue::Empty
        }
    }
}

impl From<&FeatureValue> for WireValue {
    fn from(value: &FeatureValue) -> Self {
        let mut wire = WireValue::default();
        match value {
            FeatureValue::Double(v) => wire.double_value = Some(*v),
            FeatureValue::Int64(v) => wire.int64_value = Some(Int64(*v)),
            FeatureValue::Bool(v) => wire.bool_value = Some(*v),
            FeatureValue::String(v) => wire.string_value = Some(v.clone()),
            FeatureValue::DoubleArray(v) => wire.double_array_value = Some(Values { values: v.clone() }),
            FeatureValue::Int64Array(v) => {
                wire.int64_array_value = Some(Values {
                    values: v.iter().copied().map(Int64).collect(),
                })
            }
            FeatureValue::BoolArray(v) => wire.bool_array_value = Some(Values { values: v.clone() }),
            FeatureValue::StringArray(v) => wire.string_array_value = Some(Values { values: v.clone() }),
            FeatureValue::Bytes(v) => wire.bytes_value = Some(v.clone()),
            FeatureValue::Empty => {}
        }
        wire
    }
}

impl<'de> Deserialize<'de> for FeatureValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        WireValue::deserialize(deserializer).map(FeatureValue::from)
    }
}

impl Serialize for FeatureValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        WireValue::from(self).serialize(serializer)
    }
}

/// Selects features by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSelector {
    pub id_matcher: IdMatcher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdMatcher {
    pub ids: Vec<String>,
}

impl FeatureSelector {
    pub fn ids<S: AsRef<str>>(ids: &[S]) -> Self {
        Self {
            id_matcher: IdMatcher {
                ids: ids.iter().map(|id| id.as_ref().to_string()).collect(),
            },
        }
    }
}

/// Single-entity read. `entity_type` goes into the URL, not the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFeatureValuesRequest {
    #[serde(skip)]
    pub entity_type: String,
    pub entity_id: String,
    pub feature_selector: FeatureSelector,
}

/// Multi-entity read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingReadFeatureValuesRequest {
    #[serde(skip)]
    pub entity_type: String,
    pub entity_ids: Vec<String>,
    pub feature_selector: FeatureSelector,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHeader {
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub feature_descriptors: Vec<FeatureDescriptor>,
}

/// List form used when several historical values are requested
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureValueList {
    #[serde(default)]
    pub values: Vec<FeatureValue>,
}

/// One cell of an entity view, aligned with a header descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityViewData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FeatureValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<FeatureValueList>,
}

impl EntityViewData {
    pub fn single(value: FeatureValue) -> Self {
        Self {
            value: Some(value),
            values: None,
        }
    }

    /// The single value, or the first of a value list
    pub fn latest(&self) -> Option<&FeatureValue> {
        self.value
            .as_ref()
            .or_else(|| self.values.as_ref().and_then(|list| list.values.first()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityView {
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub data: Vec<EntityViewData>,
}

/// Response of a read. On the streaming surface the first message carries
/// only the header and every following one a single entity view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFeatureValuesResponse {
    #[serde(default)]
    pub header: ResponseHeader,
    #[serde(default)]
    pub entity_view: EntityView,
}

impl ReadFeatureValuesResponse {
    /// Build a response from `(feature id, value)` pairs
    pub fn from_values<I, S>(entity_id: &str, values: I) -> Self
    where
        I: IntoIterator<Item = (S, Option<FeatureValue>)>,
        S: Into<String>,
    {
        let mut header = ResponseHeader::default();
        let mut view = EntityView {
            entity_id: entity_id.to_string(),
            data: Vec::new(),
        };
        for (id, value) in values {
            header.feature_descriptors.push(FeatureDescriptor { id: id.into() });
            view.data.push(EntityViewData { value, values: None });
        }
        Self {
            header,
            entity_view: view,
        }
    }
}
