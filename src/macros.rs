// src/macros.rs

//
// Crate-internal logging macros
//
// `logging` feature enabled  → tracing
// `logging` feature disabled → errors and warnings go to stderr, the rest
//                              compiles away
//
// Dropped and dead-lettered messages are only visible through warnings, so
// both levels survive a build without tracing.
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("ERROR {}", format_args!($($arg)*))
    };
}

// --------------------
// WARN
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        eprintln!("WARN {}", format_args!($($arg)*))
    };
}

// --------------------
// INFO
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {};
}

// --------------------
// DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
