//! Core domain types

use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a sampled thread was doing, used to bucket profiler call trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub enum ThreadCategory {
    /// Handling a web request
    #[serde(rename = "REQUEST")]
    Request,
    /// The agent's own threads (harvest, registration, profiler)
    #[serde(rename = "AGENT")]
    Agent,
    /// Running a background task
    #[serde(rename = "BACKGROUND")]
    Background,
    #[default]
    #[serde(rename = "OTHER")]
    Other,
}

impl ThreadCategory {
    pub const ALL: [ThreadCategory; 4] = [
        ThreadCategory::Request,
        ThreadCategory::Agent,
        ThreadCategory::Background,
        ThreadCategory::Other,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadCategory::Request => "REQUEST",
            ThreadCategory::Agent => "AGENT",
            ThreadCategory::Background => "BACKGROUND",
            ThreadCategory::Other => "OTHER",
        }
    }

    /// Position in [`ThreadCategory::ALL`], used for per-category arrays.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ThreadCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_index_matches_all() {
        for (idx, category) in ThreadCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), idx);
        }
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ThreadCategory::Background.to_string(), "BACKGROUND");
    }
}
