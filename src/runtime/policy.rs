use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Store version counter, bumped on every write.
pub type Epoch = u64;

/// Whether and when a store read is accompanied by a network request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    StoreOnly,
    StoreOrNetwork,
    StoreAndNetwork,
    NetworkOnly,
}

impl FetchPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchPolicy::StoreOnly => "store-only",
            FetchPolicy::StoreOrNetwork => "store-or-network",
            FetchPolicy::StoreAndNetwork => "store-and-network",
            FetchPolicy::NetworkOnly => "network-only",
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FetchPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "store-only" => Ok(FetchPolicy::StoreOnly),
            "store-or-network" => Ok(FetchPolicy::StoreOrNetwork),
            "store-and-network" => Ok(FetchPolicy::StoreAndNetwork),
            "network-only" => Ok(FetchPolicy::NetworkOnly),
            other => Err(format!("unknown fetch policy `{other}`")),
        }
    }
}

/// Whether partially available cached data may be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderPolicy {
    Full,
    Partial,
}

impl RenderPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderPolicy::Full => "full",
            RenderPolicy::Partial => "partial",
        }
    }
}

impl fmt::Display for RenderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full" => Ok(RenderPolicy::Full),
            "partial" => Ok(RenderPolicy::Partial),
            other => Err(format!("unknown render policy `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse_their_display_form() {
        for policy in [
            FetchPolicy::StoreOnly,
            FetchPolicy::StoreOrNetwork,
            FetchPolicy::StoreAndNetwork,
            FetchPolicy::NetworkOnly,
        ] {
            assert_eq!(policy.to_string().parse::<FetchPolicy>(), Ok(policy));
        }
        assert_eq!("partial".parse::<RenderPolicy>(), Ok(RenderPolicy::Partial));
        assert!("eager".parse::<FetchPolicy>().is_err());
    }
}
