//! Regions and zones.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

/// Regions and the number of zones each one has.
const REGIONS: &[(&str, u8)] = &[("fr-par", 3), ("nl-ams", 3), ("pl-waw", 3)];

/// A provider region, e.g. `fr-par`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Region(String);

/// A zone inside a region, e.g. `fr-par-2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Zone(String);

impl Region {
    pub fn parse(s: &str) -> Result<Self, String> {
        if REGIONS.iter().any(|(name, _)| *name == s) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("unknown region {:?}", s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All zones of this region, in order.
    pub fn zones(&self) -> Vec<Zone> {
        let count = REGIONS
            .iter()
            .find(|(name, _)| *name == self.0)
            .map(|(_, n)| *n)
            .unwrap_or(1);
        (1..=count)
            .map(|n| Zone(format!("{}-{}", self.0, n)))
            .collect()
    }

    /// The zone used when a resource has no zone hint.
    pub fn default_zone(&self) -> Zone {
        Zone(format!("{}-1", self.0))
    }

    pub fn contains(&self, zone: &Zone) -> bool {
        zone.region() == *self
    }
}

impl Zone {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (region, index) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("invalid zone {:?}", s))?;
        let index: u8 = index
            .parse()
            .map_err(|_| format!("invalid zone {:?}", s))?;
        let zones = REGIONS
            .iter()
            .find(|(name, _)| *name == region)
            .map(|(_, n)| *n)
            .ok_or_else(|| format!("invalid zone {:?}: unknown region", s))?;
        if index == 0 || index > zones {
            return Err(format!("invalid zone {:?}: region has {} zones", s, zones));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn region(&self) -> Region {
        let region = self
            .0
            .rsplit_once('-')
            .map(|(r, _)| r)
            .unwrap_or(self.0.as_str());
        Region(region.to_string())
    }
}

impl TryFrom<String> for Region {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Region> for String {
    fn from(r: Region) -> Self {
        r.0
    }
}

impl TryFrom<String> for Zone {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Zone> for String {
    fn from(z: Zone) -> Self {
        z.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve a zone hint against the owning region.
///
/// No hint gives the region's default zone. A hint that is not a zone of
/// `region` cannot succeed on retry and is reported as terminal.
pub fn resolve_zone(region: &Region, hint: Option<&str>) -> Result<Zone, ReconcileError> {
    let Some(hint) = hint.filter(|h| !h.is_empty()) else {
        return Ok(region.default_zone());
    };
    let zone = Zone::parse(hint).map_err(ReconcileError::terminal)?;
    if !region.contains(&zone) {
        return Err(ReconcileError::terminal(format!(
            "zone {} is not in region {}",
            zone, region
        )));
    }
    Ok(zone)
}
