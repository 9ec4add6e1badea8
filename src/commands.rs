//! Implementation of f7t CLI commands.

pub mod ci;
pub mod config;
pub mod run;
pub mod submit;
pub mod systems;
pub mod transfer;
