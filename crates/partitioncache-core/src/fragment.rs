use std::fmt;

/// Stable 40-hex-character SHA-1 hash of a canonicalized fragment's text.
///
/// Stable across restarts, operating systems and processor versions; two
/// fragments with the same canonical text always hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentHash(String);

impl FragmentHash {
    /// Wraps an already-computed 40-hex-digit hash. Used by callers that
    /// received a hash from storage or from `partitioncache_sql::hash`.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        let hex = hex.into();
        debug_assert_eq!(hex.len(), 40, "fragment hash must be 40 hex characters");
        debug_assert!(
            hex.chars().all(|c| c.is_ascii_hexdigit()),
            "fragment hash must be hex"
        );
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FragmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for FragmentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A syntactically well-formed sub-query derived from an input query, paired
/// with the stable hash of its canonical text (§3 Fragment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub hash: FragmentHash,
}

/// Outcome of the most recent attempt to execute a fragment against the
/// source database. Distinct from "not cached" (§3 Cache entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Ok,
    Timeout,
    Failed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Ok => "ok",
            CacheStatus::Timeout => "timeout",
            CacheStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(CacheStatus::Ok),
            "timeout" => Some(CacheStatus::Timeout),
            "failed" => Some(CacheStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a processor-log row originated (§3 Processor log row).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionSource {
    Cron,
    Manual,
}

impl ExecutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionSource::Cron => "cron",
            ExecutionSource::Manual => "manual",
        }
    }
}

impl fmt::Display for ExecutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
