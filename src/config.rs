//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values.
//! In local dev, call `dotenvy::dotenv().ok()` before `from_env`.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::model::DEFAULT_CAPACITY;

#[derive(Debug)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum concurrent active tasks per technician.
    pub capacity: u32,
    /// Optional external decision executable; when set, assignment selection
    /// shells out to it instead of using the in-process policy.
    pub decide_command: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let capacity = match std::env::var("DISPATCHQ_CAPACITY") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("DISPATCHQ_CAPACITY is not a number: {raw}")))?,
            Err(_) => DEFAULT_CAPACITY,
        };

        Ok(Self {
            db_path: std::env::var("DISPATCHQ_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dispatchq.db")),
            capacity,
            decide_command: std::env::var("DISPATCHQ_DECIDE_CMD").ok().map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_capacity_fails_fast() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("DISPATCHQ_CAPACITY", "three") };
        let result = Config::from_env();
        unsafe { std::env::remove_var("DISPATCHQ_CAPACITY") };

        assert!(matches!(result, Err(Error::Config(_))));
    }
}
