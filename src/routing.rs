//! Broker naming contract and routing-key matching.
//!
//! Exchange, queue and key names are shared with every other Peril process
//! on the broker and must not change.

/// Direct exchange carrying pause/resume broadcasts.
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";

/// Topic exchange carrying moves, wars and game logs.
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

/// Dead-letter exchange attached to every declared queue.
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";

/// Durable queue collecting everything routed to [`EXCHANGE_PERIL_DLX`].
pub const QUEUE_PERIL_DLQ: &str = "peril_dlq";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Queue argument naming the dead-letter exchange.
pub const DEAD_LETTER_ARG: &str = "x-dead-letter-exchange";

/// `<prefix>.<suffix>`, the key/queue naming scheme used throughout.
pub fn dotted(prefix: &str, suffix: &str) -> String {
    format!("{prefix}.{suffix}")
}

/// `<prefix>.*`, matching every player under `prefix`.
pub fn any_player(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// Match a concrete routing key against a topic binding pattern.
///
/// Keys and patterns are split on `.`. In the pattern, `*` matches exactly
/// one word and `#` matches zero or more words. Everything else must match
/// literally.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    // ---
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // ---
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
