use thiserror::Error;

/// Failure reported by a page fetcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// Transport-level failure: timeout, no connectivity, unreadable body
  #[error("Network error: {0}")]
  Network(String),

  /// Non-success response from the server
  #[error("Server error{}: {message}", status_suffix(.status))]
  Server { status: Option<u16>, message: String },
}

fn status_suffix(status: &Option<u16>) -> String {
  status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

/// Failure of a mediator load.
///
/// Cloneable because one result is handed to every coalesced caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("Storage error: {0}")]
  Storage(String),

  /// The load task died before reporting a result
  #[error("Load interrupted: {0}")]
  Interrupted(String),
}

impl LoadError {
  /// Whether a caller-initiated retry can reasonably succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, LoadError::Fetch(_))
  }
}
