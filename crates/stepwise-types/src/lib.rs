//! Shared domain types for Stepwise.
//!
//! This crate contains the process-graph model (definitions, steps,
//! transitions, conditions, actions), the live execution records the engine
//! writes while driving an instance, and the validation report.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod action;
pub mod condition;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod event;
pub mod execution;
pub mod validation;
