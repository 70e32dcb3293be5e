#![forbid(unsafe_code)]

//! MediaVault library modules shared by the server binary.

pub mod catalog;
pub mod config;
pub mod job;
pub mod resolve;
pub mod security;
pub mod ytdlp;
