//! Marketplaces the catalog can be listed on.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A marketplace with its own listing lifecycle.
///
/// Adding a marketplace means adding a variant here, a listing shape in the
/// sync crate's payload module, and an adapter registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ebay,
    Etsy,
    Shopify,
    Poshmark,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Ebay,
        Platform::Etsy,
        Platform::Shopify,
        Platform::Poshmark,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ebay => "ebay",
            Platform::Etsy => "etsy",
            Platform::Shopify => "shopify",
            Platform::Poshmark => "poshmark",
        }
    }
}

impl core::fmt::Display for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ebay" => Ok(Platform::Ebay),
            "etsy" => Ok(Platform::Etsy),
            "shopify" => Ok(Platform::Shopify),
            "poshmark" => Ok(Platform::Poshmark),
            other => Err(DomainError::invalid_id(format!("Platform: unknown `{other}`"))),
        }
    }
}
