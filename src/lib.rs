pub mod cli;
pub mod commands;
pub mod mimsi;
pub mod utils;
