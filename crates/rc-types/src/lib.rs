//! # rc-types
//!
//! Core types shared by every Racer crate: the configuration space and its
//! configurations, run keys and values, trial requests, and the error
//! taxonomy.

pub mod configuration;
pub mod errors;
pub mod run;
pub mod space;

pub use configuration::*;
pub use errors::*;
pub use run::*;
pub use space::*;
