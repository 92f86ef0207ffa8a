//! Similarity index over record embeddings.

use std::fmt;

mod flat;

pub use flat::FlatIndex;

/// How a query is compared with stored embeddings. Scores are always
/// "higher = more similar".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Angle between the vectors, in [-1, 1].
    #[default]
    Cosine,
    /// Squared euclidean distance mapped to (0, 1].
    L2,
    /// Raw inner product.
    Ip,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cosine => "cosine",
            Self::L2 => "l2",
            Self::Ip => "ip",
        })
    }
}

impl DistanceMetric {
    /// Parse a configured metric name. Unknown names mean cosine.
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "l2" | "euclidean" => Self::L2,
            "ip" | "dot" | "inner_product" => Self::Ip,
            _ => Self::Cosine,
        }
    }
}
