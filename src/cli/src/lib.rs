//! nodevm CLI - drive the container VM from the terminal.

pub mod backend;
pub mod commands;
pub mod output;
