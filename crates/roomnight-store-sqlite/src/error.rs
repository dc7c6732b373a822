//! Error type for `roomnight-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] roomnight_core::Error),

  #[error("database error: {0}")]
  Database(tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("no relation named {0:?}")]
  UnknownRelation(String),
}

/// Domain failures raised inside a connection closure travel out boxed in
/// `Other`; unbox them so callers can match on the core error.
impl From<tokio_rusqlite::Error> for Error {
  fn from(e: tokio_rusqlite::Error) -> Self {
    match e {
      tokio_rusqlite::Error::Other(inner) => match inner.downcast::<roomnight_core::Error>() {
        Ok(core) => Error::Core(*core),
        Err(other) => Error::Database(tokio_rusqlite::Error::Other(other)),
      },
      other => Error::Database(other),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result type for code running on the connection thread.
pub(crate) type DbResult<T> = std::result::Result<T, tokio_rusqlite::Error>;

/// Box a core error so it can cross the connection boundary.
pub(crate) fn fatal(e: roomnight_core::Error) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e))
}
