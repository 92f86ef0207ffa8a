use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Session tier: a named policy bundle for quotas, rates and features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise];
}

impl Default for Tier {
    fn default() -> Self {
        Self::Free
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Basic => write!(f, "basic"),
            Tier::Pro => write!(f, "pro"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// One independently metered resource axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    ApiCalls,
    Tokens,
    StorageBytes,
    BandwidthBytes,
    ConcurrentOperations,
}

impl ResourceDimension {
    pub const ALL: [ResourceDimension; 5] = [
        ResourceDimension::ApiCalls,
        ResourceDimension::Tokens,
        ResourceDimension::StorageBytes,
        ResourceDimension::BandwidthBytes,
        ResourceDimension::ConcurrentOperations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiCalls => "api_calls",
            Self::Tokens => "tokens",
            Self::StorageBytes => "storage_bytes",
            Self::BandwidthBytes => "bandwidth_bytes",
            Self::ConcurrentOperations => "concurrent_operations",
        }
    }
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api_calls" | "calls" => Ok(Self::ApiCalls),
            "tokens" => Ok(Self::Tokens),
            "storage_bytes" | "storage" => Ok(Self::StorageBytes),
            "bandwidth_bytes" | "bandwidth" => Ok(Self::BandwidthBytes),
            "concurrent_operations" | "concurrency" => Ok(Self::ConcurrentOperations),
            other => Err(format!("unknown resource dimension: {other}")),
        }
    }
}

/// Capability a tier may or may not include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    StreamingResponses,
    Rag,
    WebSearch,
    FileProcessing,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::StreamingResponses => write!(f, "streaming_responses"),
            Feature::Rag => write!(f, "rag"),
            Feature::WebSearch => write!(f, "web_search"),
            Feature::FileProcessing => write!(f, "file_processing"),
        }
    }
}

/// Gated operations. Each variant names the feature it needs, so admission
/// never has to inspect the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Chat,
    ChatStream,
    RagInitialize,
    MemoryWrite,
    MemorySearch,
    WebSearch,
    FileProcessing,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Operation::Chat,
        Operation::ChatStream,
        Operation::RagInitialize,
        Operation::MemoryWrite,
        Operation::MemorySearch,
        Operation::WebSearch,
        Operation::FileProcessing,
    ];

    pub fn required_feature(&self) -> Option<Feature> {
        match self {
            Self::Chat | Self::MemoryWrite | Self::MemorySearch => None,
            Self::ChatStream => Some(Feature::StreamingResponses),
            Self::RagInitialize => Some(Feature::Rag),
            Self::WebSearch => Some(Feature::WebSearch),
            Self::FileProcessing => Some(Feature::FileProcessing),
        }
    }

    /// Whether the operation produces its result incrementally.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::ChatStream)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::ChatStream => "chat_stream",
            Self::RagInitialize => "rag_initialize",
            Self::MemoryWrite => "memory_write",
            Self::MemorySearch => "memory_search",
            Self::WebSearch => "web_search",
            Self::FileProcessing => "file_processing",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown operation: {s}"))
    }
}

/// Accounting window of a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QuotaWindow {
    /// Never resets for the lifetime of the session.
    Lifetime,
    /// Resets `used` to 0 every `secs` seconds.
    Period { secs: u64 },
}

impl QuotaWindow {
    pub const DAILY: QuotaWindow = QuotaWindow::Period { secs: 86_400 };

    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Lifetime => None,
            Self::Period { secs } => Some(Duration::from_secs(*secs)),
        }
    }
}

/// Ceiling on admitted calls within a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCeiling {
    pub window_ms: u64,
    pub max_calls: u32,
}

impl RateCeiling {
    /// Windows are kept at millisecond resolution; anything shorter is zero
    /// and rejected by validation.
    pub fn new(window: Duration, max_calls: u32) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_calls,
        }
    }

    pub fn per_second(max_calls: u32) -> Self {
        Self { window_ms: 1_000, max_calls }
    }

    pub fn per_minute(max_calls: u32) -> Self {
        Self { window_ms: 60_000, max_calls }
    }

    pub fn per_hour(max_calls: u32) -> Self {
        Self { window_ms: 3_600_000, max_calls }
    }

    pub fn per_day(max_calls: u32) -> Self {
        Self { window_ms: 86_400_000, max_calls }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn is_valid(&self) -> bool {
        self.window_ms > 0
    }
}

impl fmt::Display for RateCeiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.window_ms % 1_000 == 0 {
            write!(f, "{}/{}s", self.max_calls, self.window_ms / 1_000)
        } else {
            write!(f, "{}/{}ms", self.max_calls, self.window_ms)
        }
    }
}
