//! Typed publish/subscribe over a [`Transport`](crate::Transport).
//!
//! - `topology`: declare and bind queues, provision the game exchanges
//! - `publisher`: encode and publish a value
//! - `subscriber`: subscriptions and the delivery loop
//! - `handler`: the capability a subscription invokes per message

mod handler;
mod publisher;
mod subscriber;
mod topology;

pub use handler::Handler;

pub use publisher::{
    //
    publish,
    publish_binary,
    publish_json,
};

pub use subscriber::{
    //
    subscribe,
    subscribe_binary,
    subscribe_json,
    DecodeFailurePolicy,
    DECODE_REQUEUE_DELAY,
    SubscribeOptions,
    SubscriptionTask,
};

pub use topology::{
    //
    declare_and_bind,
    ensure_game_topology,
};
