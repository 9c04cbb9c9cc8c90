//! Client-side handlers for the game's broadcast messages.
//!
//! Each handler applies the message to [`SharedGameState`] and classifies the
//! result. Publishing follow-up messages happens after the state lock is
//! released.

use crate::{
    // ---
    log_info,
    log_warn,
    publish_json,
    routing,
    AckVerdict,
    Handler,
    TransportPtr,
};

use super::gamelog::{publish_game_log, GameLog};
use super::messages::{ArmyMove, PlayingState, RecognitionOfWar};
use super::state::{MoveOutcome, SharedGameState, WarOutcome};

/// Applies pause/resume broadcasts.
pub fn pause_handler(state: SharedGameState) -> impl Handler<PlayingState> {
    // ---
    move |ps: PlayingState| {
        let state = state.clone();
        async move {
            state.update(|gs| gs.handle_pause(ps));
            log_info!("game {}", if ps.is_paused { "paused" } else { "resumed" });
            AckVerdict::Ack
        }
    }
}

/// Reacts to other players' army moves.
///
/// A move that lands on our units starts a war: a [`RecognitionOfWar`] is
/// published to `war.<our username>`. If that publish fails the move is
/// requeued, so the declaration is retried on redelivery.
pub fn move_handler(state: SharedGameState, transport: TransportPtr) -> impl Handler<ArmyMove> {
    // ---
    move |mv: ArmyMove| {
        let state = state.clone();
        let transport = transport.clone();
        async move {
            let (outcome, me) = state.update(|gs| (gs.handle_move(&mv), gs.player().clone()));

            match outcome {
                MoveOutcome::Safe => AckVerdict::Ack,
                MoveOutcome::SamePlayer => AckVerdict::DiscardPermanently,
                MoveOutcome::MakeWar => {
                    let key = routing::dotted(routing::WAR_RECOGNITIONS_PREFIX, &me.username);
                    let war = RecognitionOfWar {
                        attacker: mv.player,
                        defender: me,
                    };
                    match publish_json(transport.as_ref(), routing::EXCHANGE_PERIL_TOPIC, &key, &war).await {
                        Ok(()) => {
                            log_info!("{} declared war on {}", war.attacker.username, war.defender.username);
                            AckVerdict::Ack
                        }
                        Err(e) => {
                            log_warn!("war declaration to {key} failed: {e}");
                            AckVerdict::RequeueRetry
                        }
                    }
                }
            }
        }
    }
}

/// Fights wars this player is part of and logs the result.
///
/// Wars between other players are acknowledged and ignored. A war with no
/// contested location is discarded. A failed game-log publish requeues the
/// war.
pub fn war_handler(state: SharedGameState, transport: TransportPtr) -> impl Handler<RecognitionOfWar> {
    // ---
    move |war: RecognitionOfWar| {
        let state = state.clone();
        let transport = transport.clone();
        async move {
            let (resolution, me) = state.update(|gs| (gs.handle_war(&war), gs.username().to_string()));

            match resolution.outcome {
                WarOutcome::NotInvolved => AckVerdict::Ack,
                WarOutcome::NoUnits => AckVerdict::DiscardPermanently,
                WarOutcome::OpponentWon | WarOutcome::YouWon | WarOutcome::Draw => {
                    let Some(message) = resolution.log_message() else {
                        return AckVerdict::Ack;
                    };
                    log_info!("{message}");

                    let log = GameLog::now(me, message);
                    match publish_game_log(transport.as_ref(), &log).await {
                        Ok(()) => AckVerdict::Ack,
                        Err(e) => {
                            log_warn!("game log for {} not published: {e}", log.username);
                            AckVerdict::RequeueRetry
                        }
                    }
                }
            }
        }
    }
}
