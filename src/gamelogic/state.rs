//! Local game state and the rules applied to incoming events.

use std::sync::{Arc, Mutex};

use crate::{lock_ignore_poison, PerilError, Result};

use super::messages::{ArmyMove, Location, Player, PlayingState, RecognitionOfWar, Unit, UnitRank};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// None of our units share a location with the mover.
    Safe,
    /// The mover's units share a location with ours.
    MakeWar,
    /// We are the mover.
    SamePlayer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarOutcome {
    NotInvolved,
    NoUnits,
    OpponentWon,
    YouWon,
    Draw,
}

/// Result of resolving a war, from the local player's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarResolution {
    pub outcome: WarOutcome,
    pub winner: String,
    pub loser: String,
}

impl WarResolution {
    fn uninvolved(outcome: WarOutcome) -> Self {
        Self {
            outcome,
            winner: String::new(),
            loser: String::new(),
        }
    }

    /// Line recorded in the game log for a fought war.
    pub fn log_message(&self) -> Option<String> {
        // ---
        match self.outcome {
            WarOutcome::YouWon | WarOutcome::OpponentWon => {
                Some(format!("{} won a war against {}", self.winner, self.loser))
            }
            WarOutcome::Draw => Some(format!(
                "A war between {} and {} resulted in a draw",
                self.winner, self.loser
            )),
            WarOutcome::NotInvolved | WarOutcome::NoUnits => None,
        }
    }
}

/// One player's view of the game.
#[derive(Debug, Clone)]
pub struct GameState {
    player: Player,
    paused: bool,
    next_unit_id: u32,
}

impl GameState {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            player: Player::new(username),
            paused: false,
            next_unit_id: 1,
        }
    }

    pub fn username(&self) -> &str {
        &self.player.username
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn spawn(&mut self, location: Location, rank: UnitRank) -> Unit {
        // ---
        let unit = Unit {
            id: self.next_unit_id,
            rank,
            location,
        };
        self.next_unit_id += 1;
        self.player.units.insert(unit.id, unit.clone());
        unit
    }

    /// `spawn <location> <rank>`
    pub fn command_spawn(&mut self, words: &[&str]) -> Result<Unit> {
        // ---
        let [_, location, rank] = words else {
            return Err(PerilError::Command("usage: spawn <location> <rank>".into()));
        };
        let location = location.parse::<Location>()?;
        let rank = rank.parse::<UnitRank>()?;
        Ok(self.spawn(location, rank))
    }

    /// `move <location> <unit_id> [<unit_id>...]`
    ///
    /// Moves our own units and returns the event to publish. Refused while
    /// the game is paused.
    pub fn command_move(&mut self, words: &[&str]) -> Result<ArmyMove> {
        // ---
        if self.paused {
            return Err(PerilError::Command("the game is paused, you cannot move units".into()));
        }
        let [_, location, ids @ ..] = words else {
            return Err(PerilError::Command("usage: move <location> <unit_id>...".into()));
        };
        if ids.is_empty() {
            return Err(PerilError::Command("usage: move <location> <unit_id>...".into()));
        }
        let to_location = location.parse::<Location>()?;

        let mut ids_parsed = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = raw
                .parse::<u32>()
                .map_err(|_| PerilError::Command(format!("invalid unit id '{raw}'")))?;
            if !self.player.units.contains_key(&id) {
                return Err(PerilError::Command(format!("no unit with id {id}")));
            }
            ids_parsed.push(id);
        }

        let mut units = Vec::with_capacity(ids_parsed.len());
        for id in ids_parsed {
            if let Some(unit) = self.player.units.get_mut(&id) {
                unit.location = to_location;
                units.push(unit.clone());
            }
        }

        Ok(ArmyMove {
            player: self.player.clone(),
            units,
            to_location,
        })
    }

    /// Human-readable summary for the `status` command.
    pub fn status(&self) -> String {
        // ---
        let mut out = format!("You are {}, and you have these units:", self.player.username);
        for unit in self.player.units.values() {
            out.push_str(&format!("\n* {}: {}, {}", unit.id, unit.location, unit.rank));
        }
        if self.paused {
            out.push_str("\nThe game is paused.");
        }
        out
    }

    pub fn handle_pause(&mut self, state: PlayingState) {
        self.paused = state.is_paused;
    }

    pub fn handle_move(&self, mv: &ArmyMove) -> MoveOutcome {
        // ---
        if mv.player.username == self.player.username {
            return MoveOutcome::SamePlayer;
        }
        match overlapping_location(&self.player, &mv.player) {
            Some(_) => MoveOutcome::MakeWar,
            None => MoveOutcome::Safe,
        }
    }

    /// Fight the war if we are a party to it.
    ///
    /// The side with more power at the contested location wins; the loser's
    /// units there are destroyed. On a draw both sides lose them.
    pub fn handle_war(&mut self, war: &RecognitionOfWar) -> WarResolution {
        // ---
        let me = self.player.username.clone();
        if war.attacker.username != me && war.defender.username != me {
            return WarResolution::uninvolved(WarOutcome::NotInvolved);
        }

        let Some(location) = overlapping_location(&war.attacker, &war.defender) else {
            return WarResolution::uninvolved(WarOutcome::NoUnits);
        };

        let attacker_power = war.attacker.power_at(location);
        let defender_power = war.defender.power_at(location);
        let attacker = war.attacker.username.clone();
        let defender = war.defender.username.clone();

        let (winner, loser) = match attacker_power.cmp(&defender_power) {
            std::cmp::Ordering::Greater => (attacker, defender),
            std::cmp::Ordering::Less => (defender, attacker),
            std::cmp::Ordering::Equal => {
                self.remove_units_at(location);
                return WarResolution {
                    outcome: WarOutcome::Draw,
                    winner: attacker,
                    loser: defender,
                };
            }
        };

        let outcome = if winner == me {
            WarOutcome::YouWon
        } else {
            self.remove_units_at(location);
            WarOutcome::OpponentWon
        };

        WarResolution {
            outcome,
            winner,
            loser,
        }
    }

    fn remove_units_at(&mut self, location: Location) {
        self.player.units.retain(|_, unit| unit.location != location);
    }
}

/// First location where both players have units.
fn overlapping_location(a: &Player, b: &Player) -> Option<Location> {
    // ---
    a.units
        .values()
        .map(|u| u.location)
        .find(|loc| b.units_at(*loc).next().is_some())
}

/// The single place game state is mutated from.
///
/// Handlers run on their subscriptions' tasks, the command loop on the main
/// task; all of them go through this lock. Critical sections are plain
/// closures, so the lock can never be held across an `.await`.
#[derive(Debug, Clone)]
pub struct SharedGameState {
    inner: Arc<Mutex<GameState>>,
}

impl SharedGameState {
    pub fn new(state: GameState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Run `f` with exclusive access to the state.
    pub fn update<R>(&self, f: impl FnOnce(&mut GameState) -> R) -> R {
        let mut guard = lock_ignore_poison(&self.inner);
        f(&mut guard)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> GameState {
        lock_ignore_poison(&self.inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_with(name: &str, units: &[(u32, UnitRank, Location)]) -> Player {
        let mut player = Player::new(name);
        for (id, rank, location) in units {
            player.units.insert(
                *id,
                Unit {
                    id: *id,
                    rank: *rank,
                    location: *location,
                },
            );
        }
        player
    }

    #[test]
    fn spawn_and_move_commands() {
        // ---
        let mut gs = GameState::new("alice");
        let unit = gs.command_spawn(&["spawn", "europe", "infantry"]).expect("spawn");
        assert_eq!(unit.id, 1);

        let mv = gs.command_move(&["move", "asia", "1"]).expect("move");
        assert_eq!(mv.to_location, Location::Asia);
        assert_eq!(mv.units.len(), 1);
        assert_eq!(mv.player.units[&1].location, Location::Asia);

        assert!(gs.command_move(&["move", "asia", "9"]).is_err());
        assert!(gs.command_spawn(&["spawn", "moon", "infantry"]).is_err());
    }

    #[test]
    fn paused_game_refuses_moves() {
        // ---
        let mut gs = GameState::new("alice");
        gs.spawn(Location::Europe, UnitRank::Cavalry);
        gs.handle_pause(PlayingState { is_paused: true });

        assert!(gs.command_move(&["move", "asia", "1"]).is_err());

        gs.handle_pause(PlayingState { is_paused: false });
        assert!(gs.command_move(&["move", "asia", "1"]).is_ok());
    }

    #[test]
    fn move_outcomes() {
        // ---
        let mut gs = GameState::new("alice");
        gs.spawn(Location::Europe, UnitRank::Infantry);

        let mv = |player: Player| ArmyMove {
            units: player.units.values().cloned().collect(),
            to_location: Location::Europe,
            player,
        };

        let own = mv(gs.player().clone());
        assert_eq!(gs.handle_move(&own), MoveOutcome::SamePlayer);

        let hostile = mv(player_with("bob", &[(1, UnitRank::Cavalry, Location::Europe)]));
        assert_eq!(gs.handle_move(&hostile), MoveOutcome::MakeWar);

        let far = mv(player_with("bob", &[(1, UnitRank::Cavalry, Location::Asia)]));
        assert_eq!(gs.handle_move(&far), MoveOutcome::Safe);
    }

    #[test]
    fn war_resolution() {
        // ---
        let mut gs = GameState::new("alice");
        gs.spawn(Location::Europe, UnitRank::Infantry);
        gs.spawn(Location::Asia, UnitRank::Artillery);

        let bob = player_with("bob", &[(1, UnitRank::Cavalry, Location::Europe)]);
        let war = RecognitionOfWar {
            attacker: bob.clone(),
            defender: gs.player().clone(),
        };

        let resolution = gs.handle_war(&war);
        assert_eq!(resolution.outcome, WarOutcome::OpponentWon);
        assert_eq!(resolution.winner, "bob");
        assert_eq!(
            resolution.log_message().as_deref(),
            Some("bob won a war against alice")
        );
        // Europe lost, Asia kept.
        assert_eq!(gs.player().units.len(), 1);
        assert_eq!(gs.player().power_at(Location::Asia), 10);

        let outsiders = RecognitionOfWar {
            attacker: bob,
            defender: player_with("carol", &[]),
        };
        assert_eq!(gs.handle_war(&outsiders).outcome, WarOutcome::NotInvolved);
    }

    #[test]
    fn war_without_contact_is_no_units() {
        // ---
        let mut gs = GameState::new("alice");
        gs.spawn(Location::Europe, UnitRank::Infantry);
        let war = RecognitionOfWar {
            attacker: player_with("bob", &[(1, UnitRank::Cavalry, Location::Asia)]),
            defender: gs.player().clone(),
        };
        assert_eq!(gs.handle_war(&war).outcome, WarOutcome::NoUnits);
    }

    #[test]
    fn shared_state_updates_are_visible() {
        // ---
        let shared = SharedGameState::new(GameState::new("alice"));
        let clone = shared.clone();
        clone.update(|gs| gs.handle_pause(PlayingState { is_paused: true }));
        assert!(shared.snapshot().is_paused());
    }
}
