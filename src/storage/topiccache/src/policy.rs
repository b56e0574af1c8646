// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use core::str::FromStr;

/// Topic level retention strategy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CleanupPolicy {
    #[default]
    Delete,
    Compact,
    CompactAndDelete,
    Unknown,
}

impl CleanupPolicy {
    /// Records may be dropped once a newer record with the same key exists.
    pub fn compacts(&self) -> bool {
        matches!(self, Self::Compact | Self::CompactAndDelete)
    }

    /// Whole segments may be dropped once they age out of retention.
    pub fn deletes(&self) -> bool {
        matches!(self, Self::Delete | Self::CompactAndDelete)
    }
}

impl FromStr for CleanupPolicy {
    type Err = core::convert::Infallible;

    /// Parsing never fails; unrecognized strings become `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        let policy = match normalized.as_str() {
            "delete" => Self::Delete,
            "compact" => Self::Compact,
            "compact,delete" | "delete,compact" | "compact+delete" | "compact_and_delete" => {
                Self::CompactAndDelete
            }
            _ => Self::Unknown,
        };

        Ok(policy)
    }
}

impl core::fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Delete => "delete",
            Self::Compact => "compact",
            Self::CompactAndDelete => "compact,delete",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
