//! Configuration module for encode-farm
//!
//! Handles loading and persisting the TOML configuration shared by the local
//! pool, the distributed client, and the encode server binary.

pub mod config;

pub use config::*;
