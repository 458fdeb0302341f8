pub mod cli;
pub mod commands;
pub mod config;
pub mod control;
pub mod errors;
pub mod logging;
pub mod output;
pub mod registry;
pub mod runtime;
pub mod serve;
pub mod webhook;
