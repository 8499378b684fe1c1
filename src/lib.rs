//! NetPulse pinger: continuous ICMP liveness monitoring of a set of targets,
//! with status pushed over a publish/subscribe control channel.

pub mod api;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod models;
pub mod notify;
pub mod prober;
pub mod registry;
pub mod stats;
pub mod utils;
pub mod worker;
