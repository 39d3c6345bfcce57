//! `joulegate-core` -- domain logic for gated energy measurement.
//!
//! Everything in this crate is free of database and queue concerns: the
//! data model, the error taxonomy, the sandboxed candidate runner, the
//! correctness validator, calibration, isolation, the resource lock
//! abstraction, energy counter sampling and the statistics used by the
//! trial orchestrator.

pub mod calibration;
pub mod compare;
pub mod energy;
pub mod error;
pub mod isolation;
pub mod lock;
pub mod metrics;
pub mod policy;
pub mod request;
pub mod sandbox;
pub mod stats;
pub mod task;
pub mod types;
pub mod validation;
pub mod validator;
