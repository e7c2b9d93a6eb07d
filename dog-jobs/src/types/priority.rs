use serde::{Deserialize, Serialize};
use tracing::warn;

/// Job priority levels for queue ordering (Higher values = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    /// Low priority jobs (processed last)
    Low = 1,

    /// Normal priority jobs (default)
    Normal = 2,

    Medium = 3,

    High = 4,

    /// Critical priority jobs (processed first)
    Critical = 5,
}

// Claim order: sort by (Reverse(priority), created_at), so higher priority
// first and FIFO within one level.

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    /// Get all priority levels in order (low to high)
    pub fn all() -> &'static [Priority] {
        &[
            Self::Low,
            Self::Normal,
            Self::Medium,
            Self::High,
            Self::Critical,
        ]
    }

    /// Get the numeric value for ordering
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Create from numeric value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::Medium),
            4 => Some(Self::High),
            5 => Some(Self::Critical),
            _ => None,
        }
    }

    /// Map any stored value onto a valid level, falling back to `Normal`.
    pub fn sanitize(value: i64) -> Self {
        match u8::try_from(value).ok().and_then(Self::from_u8) {
            Some(priority) => priority,
            None => {
                warn!(value, "invalid priority value, using normal");
                Self::Normal
            }
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.as_u8()
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("Invalid priority: {}", value))
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}
