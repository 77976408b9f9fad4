//! Workflow engine and repository trait definitions for Stepwise.
//!
//! This crate defines the "ports" (repository and capability traits) that the
//! infrastructure layer and host applications implement, plus the engine that
//! drives process instances through their definitions. It depends only on
//! `stepwise-types` -- never on `stepwise-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
