//! Collective communication engine over pluggable transports.

pub mod distributed;
pub mod utils;
