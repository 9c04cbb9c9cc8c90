//! Game rules and the handlers wiring them to the broker.

mod gamelog;
mod handlers;
mod messages;
mod state;

pub use gamelog::{
    //
    game_log_handler,
    game_log_target,
    publish_game_log,
    start_game_log_worker,
    FileLogSink,
    GameLog,
    LogSink,
    MemoryLogSink,
};

pub use handlers::{
    //
    move_handler,
    pause_handler,
    war_handler,
};

pub use messages::{
    //
    ArmyMove,
    Location,
    Player,
    PlayingState,
    RecognitionOfWar,
    Unit,
    UnitRank,
};

pub use state::{
    //
    GameState,
    MoveOutcome,
    SharedGameState,
    WarOutcome,
    WarResolution,
};
