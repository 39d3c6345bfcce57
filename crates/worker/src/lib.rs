//! Measurement worker: configuration and process wiring.

pub mod config;
