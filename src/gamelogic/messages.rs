//! Gameplay payloads.
//!
//! Field names follow the PascalCase JSON the other Peril clients speak.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::PerilError;

/// Pause state broadcast by the server on `peril_direct`/`pause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Americas,
    Europe,
    Africa,
    Asia,
    Antarctica,
    Australia,
}

impl Location {
    pub const ALL: [Location; 6] = [
        Location::Americas,
        Location::Europe,
        Location::Africa,
        Location::Asia,
        Location::Antarctica,
        Location::Australia,
    ];
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Location::Americas => "americas",
            Location::Europe => "europe",
            Location::Africa => "africa",
            Location::Asia => "asia",
            Location::Antarctica => "antarctica",
            Location::Australia => "australia",
        };
        f.write_str(name)
    }
}

impl FromStr for Location {
    type Err = PerilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Location::ALL
            .into_iter()
            .find(|loc| loc.to_string() == s)
            .ok_or_else(|| PerilError::Command(format!("unknown location '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitRank {
    Infantry,
    Cavalry,
    Artillery,
}

impl UnitRank {
    /// Strength contributed to a battle.
    pub fn power(self) -> u32 {
        match self {
            UnitRank::Infantry => 1,
            UnitRank::Cavalry => 5,
            UnitRank::Artillery => 10,
        }
    }
}

impl fmt::Display for UnitRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitRank::Infantry => "infantry",
            UnitRank::Cavalry => "cavalry",
            UnitRank::Artillery => "artillery",
        };
        f.write_str(name)
    }
}

impl FromStr for UnitRank {
    type Err = PerilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "infantry" => Ok(UnitRank::Infantry),
            "cavalry" => Ok(UnitRank::Cavalry),
            "artillery" => Ok(UnitRank::Artillery),
            other => Err(PerilError::Command(format!("unknown unit rank '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Unit {
    #[serde(rename = "ID")]
    pub id: u32,
    pub rank: UnitRank,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Player {
    pub username: String,
    pub units: BTreeMap<u32, Unit>,
}

impl Player {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            units: BTreeMap::new(),
        }
    }

    pub fn units_at(&self, location: Location) -> impl Iterator<Item = &Unit> {
        self.units.values().filter(move |u| u.location == location)
    }

    /// Total power of this player's units at `location`.
    pub fn power_at(&self, location: Location) -> u32 {
        self.units_at(location).map(|u| u.rank.power()).sum()
    }
}

/// A player's move, published to `army_moves.<username>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArmyMove {
    /// Snapshot of the mover after the move.
    pub player: Player,
    pub units: Vec<Unit>,
    pub to_location: Location,
}

/// Declared by a player who detected hostile units next to theirs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionOfWar {
    pub attacker: Player,
    pub defender: Player,
}
