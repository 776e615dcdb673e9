//! Error types shared by every dockform component.
//!
//! Every surfaced error carries an operation tag (`op`) and a stable [`ErrorKind`] so
//! callers can branch on the category (retry on `Unavailable`, hard-fail on
//! `InvalidInput`) without parsing message text.
//!
//! Independent failures are collected in an [`ErrorList`], which has exactly one merge
//! point per concurrent phase.

use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  /// Malformed desired state, bad glob or ownership spec, malformed plan.
  InvalidInput,
  /// Missing file, missing source directory.
  NotFound,
  /// Precondition failed, e.g. a network spec mismatch under the `error` policy.
  Conflict,
  /// Runtime endpoint unreachable.
  Unavailable,
  /// A wrapped external tool failure.
  External,
  /// Invariant violation, e.g. path traversal during a tree walk.
  Internal,
  /// The operation was cancelled before it completed.
  Cancelled,
  /// Several failures of differing kinds.
  Multiple,
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ErrorKind::InvalidInput => "invalid input",
      ErrorKind::NotFound => "not found",
      ErrorKind::Conflict => "conflict",
      ErrorKind::Unavailable => "unavailable",
      ErrorKind::External => "external",
      ErrorKind::Internal => "internal",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::Multiple => "multiple",
    };
    f.write_str(s)
  }
}

/// The library error.
#[derive(Debug, Error)]
pub enum Error {
  /// A single failure of one operation.
  #[error("{op}: {message}")]
  Op {
    op: String,
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
  },

  /// Several independent failures.
  #[error(transparent)]
  Multiple(ErrorList),
}

impl Error {
  pub fn new(kind: ErrorKind, op: impl Into<String>, message: impl Into<String>) -> Self {
    Error::Op {
      op: op.into(),
      kind,
      message: message.into(),
      source: None,
    }
  }

  /// Attach an underlying cause.
  pub fn with_source(self, cause: impl Into<BoxError>) -> Self {
    match self {
      Error::Op { op, kind, message, .. } => Error::Op {
        op,
        kind,
        message,
        source: Some(cause.into()),
      },
      other => other,
    }
  }

  pub fn invalid_input(op: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(ErrorKind::InvalidInput, op, message)
  }

  pub fn not_found(op: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(ErrorKind::NotFound, op, message)
  }

  pub fn conflict(op: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Conflict, op, message)
  }

  pub fn unavailable(op: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Unavailable, op, message)
  }

  pub fn external(op: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(ErrorKind::External, op, message)
  }

  pub fn internal(op: impl Into<String>, message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Internal, op, message)
  }

  pub fn cancelled(op: impl Into<String>) -> Self {
    Self::new(ErrorKind::Cancelled, op, "operation cancelled")
  }

  /// Wrap an I/O error, mapping `NotFound` onto [`ErrorKind::NotFound`].
  pub fn io(op: impl Into<String>, context: impl fmt::Display, err: std::io::Error) -> Self {
    let kind = match err.kind() {
      std::io::ErrorKind::NotFound => ErrorKind::NotFound,
      _ => ErrorKind::Internal,
    };
    Self::new(kind, op, format!("{}: {}", context, err)).with_source(err)
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Op { kind, .. } => *kind,
      Error::Multiple(list) => list.kind(),
    }
  }

  /// The operation tag. Aggregates report `"multiple"`.
  pub fn op(&self) -> &str {
    match self {
      Error::Op { op, .. } => op,
      Error::Multiple(_) => "multiple",
    }
  }

  /// Flatten into individual errors.
  pub fn into_errors(self) -> Vec<Error> {
    match self {
      Error::Multiple(list) => list.errors,
      other => vec![other],
    }
  }
}

/// Accumulator for independent failures.
#[derive(Debug, Default)]
pub struct ErrorList {
  errors: Vec<Error>,
}

impl ErrorList {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record an error. Nested lists are flattened.
  pub fn add(&mut self, err: Error) {
    match err {
      Error::Multiple(list) => self.errors.extend(list.errors),
      other => self.errors.push(other),
    }
  }

  /// Record the error of a result, returning the success value if any.
  pub fn capture<T>(&mut self, result: Result<T>) -> Option<T> {
    match result {
      Ok(value) => Some(value),
      Err(e) => {
        self.add(e);
        None
      }
    }
  }

  pub fn extend(&mut self, other: ErrorList) {
    self.errors.extend(other.errors);
  }

  pub fn errors(&self) -> &[Error] {
    &self.errors
  }

  pub fn is_empty(&self) -> bool {
    self.errors.is_empty()
  }

  pub fn len(&self) -> usize {
    self.errors.len()
  }

  /// Shared kind of all members, `Multiple` when they differ.
  pub fn kind(&self) -> ErrorKind {
    let mut kinds = self.errors.iter().map(Error::kind);
    match kinds.next() {
      Some(first) if kinds.all(|k| k == first) => first,
      Some(_) => ErrorKind::Multiple,
      None => ErrorKind::Internal,
    }
  }

  /// `Ok(())` when empty, the sole error when there is one, the aggregate otherwise.
  pub fn into_result(mut self) -> Result<()> {
    match self.errors.len() {
      0 => Ok(()),
      1 => Err(self.errors.remove(0)),
      _ => Err(Error::Multiple(self)),
    }
  }
}

impl fmt::Display for ErrorList {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} errors occurred:", self.errors.len())?;
    for err in &self.errors {
      write!(f, "\n  * {}", err)?;
    }
    Ok(())
  }
}

impl std::error::Error for ErrorList {}
