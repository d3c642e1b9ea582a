//! # PoolSentry Dataplane
//!
//! Ingestion side of PoolSentry - responsible for pulling hourly pool
//! statistics from DEX subgraphs, flattening them into clean tables and
//! engineering the per-pool features the anomaly model is trained on.

pub mod archive;
pub mod config;
pub mod error;
pub mod features;
pub mod fetcher;
pub mod loader;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::{DataplaneConfig, ProtocolConfig};
pub use error::{DataplaneError, Result};
pub use types::*;

/// Current version of the dataplane
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Supported DEX protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Protocol {
    #[serde(rename = "uniswap")]
    Uniswap,
    #[serde(rename = "sushiswap")]
    Sushiswap,
}

impl Protocol {
    /// All protocols, in load order
    pub const ALL: [Protocol; 2] = [Protocol::Uniswap, Protocol::Sushiswap];

    /// Get the human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Uniswap => "uniswap",
            Protocol::Sushiswap => "sushiswap",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = DataplaneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "uniswap" | "uni" => Ok(Protocol::Uniswap),
            "sushiswap" | "sushi" => Ok(Protocol::Sushiswap),
            _ => Err(DataplaneError::UnknownProtocol(s.to_string())),
        }
    }
}
