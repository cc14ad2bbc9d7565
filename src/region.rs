use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The eight canonical regions plus the `global` fallback (§6 "Region
/// taxonomy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    UsEast,
    UsWest,
    EuWest,
    EuCentral,
    AsiaPacific,
    AsiaSouth,
    SouthAmerica,
    Global,
}

impl Region {
    pub const ALL: [Region; 8] = [
        Region::UsEast,
        Region::UsWest,
        Region::EuWest,
        Region::EuCentral,
        Region::AsiaPacific,
        Region::AsiaSouth,
        Region::SouthAmerica,
        Region::Global,
    ];

    pub fn index(self) -> u8 {
        Self::ALL.iter().position(|r| *r == self).unwrap() as u8
    }
}

impl FromStr for Region {
    type Err = std::convert::Infallible;

    /// Unknown region strings map to `global` (§6), never an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "us-east" => Region::UsEast,
            "us-west" => Region::UsWest,
            "eu-west" => Region::EuWest,
            "eu-central" => Region::EuCentral,
            "asia-pacific" => Region::AsiaPacific,
            "asia-south" => Region::AsiaSouth,
            "south-america" => Region::SouthAmerica,
            _ => Region::Global,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_region_maps_to_global() {
        assert_eq!(Region::from_str("mars").unwrap(), Region::Global);
    }

    #[test]
    fn known_region_round_trips_through_index() {
        for r in Region::ALL {
            assert_eq!(Region::ALL[r.index() as usize], r);
        }
    }
}
