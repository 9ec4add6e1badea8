//! The `f7t` command line tool for submitting and tracking HPC jobs through
//! the FirecREST API.

pub mod commands;
pub mod config;
