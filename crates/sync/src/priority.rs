//! Deterministic tie-break between platforms that disagree about a sale.

use serde::{Deserialize, Serialize};

use forgelist_core::{DomainError, Platform};

/// Platforms in descending authority. Unlisted platforms rank last, equally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Platform>", into = "Vec<Platform>")]
pub struct PlatformPriority(Vec<Platform>);

impl PlatformPriority {
    pub fn new(order: Vec<Platform>) -> Result<Self, DomainError> {
        for (idx, platform) in order.iter().enumerate() {
            if order[..idx].contains(platform) {
                return Err(DomainError::validation(format!(
                    "platform priority lists `{platform}` twice"
                )));
            }
        }
        Ok(Self(order))
    }

    pub fn order(&self) -> &[Platform] {
        &self.0
    }

    pub fn rank(&self, platform: Platform) -> usize {
        self.0
            .iter()
            .position(|p| *p == platform)
            .unwrap_or(self.0.len())
    }

    pub fn outranks(&self, a: Platform, b: Platform) -> bool {
        self.rank(a) < self.rank(b)
    }

    /// `incumbent` keeps the sale unless `challenger` strictly outranks it.
    pub fn winner(&self, incumbent: Platform, challenger: Platform) -> Platform {
        if self.outranks(challenger, incumbent) {
            challenger
        } else {
            incumbent
        }
    }
}

impl Default for PlatformPriority {
    fn default() -> Self {
        Self(Platform::ALL.to_vec())
    }
}

impl TryFrom<Vec<Platform>> for PlatformPriority {
    type Error = DomainError;

    fn try_from(value: Vec<Platform>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PlatformPriority> for Vec<Platform> {
    fn from(value: PlatformPriority) -> Self {
        value.0
    }
}

impl core::str::FromStr for PlatformPriority {
    type Err = DomainError;

    /// Comma-separated list, highest priority first: `ebay,shopify,etsy`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let order = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Platform>, _>>()?;
        Self::new(order)
    }
}
