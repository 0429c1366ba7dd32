//! Client-side pieces: CLI-to-request translation and the attach relay.

pub mod client;

pub use client::run_client;
