//! Online feature store access
//!
//! Reads the latest per-pool features from the serving API, decodes the
//! typed values and backfills missing ones.

pub mod client;
pub mod decode;
pub mod rest;
pub mod types;

pub use client::{shared_client, FeatureStoreClient, OnlineServingApi};
pub use decode::{backfill, decode_features, FeatureMap};
pub use rest::{RestOnlineServingClient, TokenSource};
pub use types::{FeatureValue, ReadFeatureValuesRequest, ReadFeatureValuesResponse};
