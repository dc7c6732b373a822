//! Layered settings: built-in defaults, then an optional TOML file, then
//! `ROOMNIGHT_*` environment variables (`__` separates nested keys, e.g.
//! `ROOMNIGHT_RETRY__MAX_ATTEMPTS`).

use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use chrono::NaiveDate;
use roomnight_core::pipeline::RetryPolicy;
use roomnight_store_sqlite::CalendarRange;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  pub database_path:   PathBuf,
  /// Steps allowed to materialize at once.
  pub max_concurrency: usize,
  pub calendar_start:  NaiveDate,
  pub calendar_end:    NaiveDate,
  /// Largest row chunk a raw extract reads at once.
  pub chunk_rows:      u64,
  pub retry:           RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
  pub max_attempts: u32,
  pub backoff_ms:   u64,
}

impl Settings {
  pub fn load(file: Option<PathBuf>) -> anyhow::Result<Self> {
    let file = file.unwrap_or_else(|| PathBuf::from("roomnight.toml"));
    Self::builder()?
      .add_source(config::File::from(file).required(false))
      .add_source(
        config::Environment::with_prefix("ROOMNIGHT")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read configuration")?
      .try_deserialize()
      .context("failed to deserialise Settings")
  }

  fn builder() -> anyhow::Result<config::ConfigBuilder<config::builder::DefaultState>> {
    Ok(
      config::Config::builder()
        .set_default("database_path", "roomnight.db")?
        .set_default("max_concurrency", 4)?
        .set_default("calendar_start", "2024-01-01")?
        .set_default("calendar_end", "2024-12-31")?
        .set_default("chunk_rows", 10_000)?
        .set_default("retry.max_attempts", 1)?
        .set_default("retry.backoff_ms", 500)?,
    )
  }

  pub fn calendar(&self) -> CalendarRange {
    CalendarRange { start: self.calendar_start, end: self.calendar_end }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry.max_attempts,
      backoff:      Duration::from_millis(self.retry.backoff_ms),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn from_toml(toml: &str) -> Settings {
    Settings::builder()
      .unwrap()
      .add_source(config::File::from_str(toml, config::FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn defaults_apply_without_a_file() {
    let s = from_toml("");
    assert_eq!(s.database_path, PathBuf::from("roomnight.db"));
    assert_eq!(s.max_concurrency, 4);
    assert_eq!(s.retry_policy().max_attempts, 1);
    assert_eq!(s.retry_policy().backoff, Duration::from_millis(500));
    assert_eq!(s.calendar().days(), 366);
    assert_eq!(s.chunk_rows, 10_000);
  }

  #[test]
  fn file_overrides_defaults() {
    let s = from_toml(
      r#"
      max_concurrency = 2
      chunk_rows = 250
      calendar_end = "2024-01-31"

      [retry]
      max_attempts = 3
      "#,
    );
    assert_eq!(s.max_concurrency, 2);
    assert_eq!(s.chunk_rows, 250);
    assert_eq!(s.calendar().days(), 31);
    assert_eq!(s.retry.max_attempts, 3);
    assert_eq!(s.retry.backoff_ms, 500);
  }
}
