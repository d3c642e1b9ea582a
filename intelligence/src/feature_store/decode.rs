//! Response decoding and default backfill

use std::collections::HashMap;

use super::types::{EntityView, ReadFeatureValuesResponse, ResponseHeader};

/// Numeric features of one entity, keyed by feature id
pub type FeatureMap = HashMap<String, f64>;

/// Short feature id from a descriptor id that may be a full resource name
pub fn feature_id(descriptor_id: &str) -> &str {
    descriptor_id.rsplit('/').next().unwrap_or(descriptor_id)
}

/// Decode an entity view against the descriptors of a header.
///
/// `data[i]` belongs to `feature_descriptors[i]`. Doubles are kept, int64 is
/// widened, every other value kind and absent cells are skipped.
pub fn decode_entity_view(header: &ResponseHeader, view: &EntityView) -> FeatureMap {
    header
        .feature_descriptors
        .iter()
        .zip(view.data.iter())
        .filter_map(|(descriptor, data)| {
            let value = data.latest()?.as_f64()?;
            Some((feature_id(&descriptor.id).to_string(), value))
        })
        .collect()
}

/// Decode a single-entity response
pub fn decode_features(response: &ReadFeatureValuesResponse) -> FeatureMap {
    decode_entity_view(&response.header, &response.entity_view)
}

/// Insert `default` for every requested id missing from `features`.
/// Without a default the map is returned untouched.
pub fn backfill<S: AsRef<str>>(mut features: FeatureMap, feature_ids: &[S], default: Option<f64>) -> FeatureMap {
    if let Some(default) = default {
        for id in feature_ids {
            features.entry(id.as_ref().to_string()).or_insert(default);
        }
    }
    features
}
