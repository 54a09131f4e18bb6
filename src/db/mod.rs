//! Database module: write models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: patch types and view models moved by repositories.
//! - `repo`: SQL-only functions for the control record and image metadata.
//!
//! Callers import from `imgu_sync::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ControlPatch, ImagePage, ImageStats, Patch};
