//! The matchable error taxonomy the focus uses to translate internal
//! failures into the stanza/HTTP error kinds clients observe.

use thiserror::Error;

/// The distinguishable reasons a candidate `SourceSet` can be rejected,
/// carried as a tag alongside the free-text message so callers can match on
/// it instead of grepping `to_string()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRejectionTag {
  DuplicateSource,
  SsrcConflict,
  GroupMemberMissing,
  GroupArity,
  UnsupportedGroup,
  QuotaExceeded,
  InvalidOwner,
}

impl SourceRejectionTag {
  pub fn as_str(&self) -> &'static str {
    match self {
      SourceRejectionTag::DuplicateSource => "duplicate-source",
      SourceRejectionTag::SsrcConflict => "ssrc-conflict",
      SourceRejectionTag::GroupMemberMissing => "group-member-missing",
      SourceRejectionTag::GroupArity => "group-arity",
      SourceRejectionTag::UnsupportedGroup => "unsupported-group",
      SourceRejectionTag::QuotaExceeded => "quota-exceeded",
      SourceRejectionTag::InvalidOwner => "invalid-owner",
    }
  }
}

impl std::fmt::Display for SourceRejectionTag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Every externally-visible failure kind the focus can report.
#[derive(Error, Debug)]
pub enum FocusError {
  #[error("not authorized")]
  NotAuthorized,

  #[error("forbidden")]
  Forbidden,

  #[error("not acceptable: {0}")]
  NotAcceptable(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("source rejected ({tag}): {message}")]
  SourceRejected { tag: SourceRejectionTag, message: String },

  #[error("item not found")]
  ItemNotFound,

  #[error("service unavailable")]
  ServiceUnavailable,

  #[error("resource constraint")]
  ResourceConstraint,

  #[error("conflict")]
  Conflict,

  #[error("timeout")]
  Timeout,

  #[error("not connected")]
  NotConnected,

  #[error("session invalid")]
  SessionInvalid,

  #[error("reservation error {code}: {message}")]
  Reservation { code: u16, message: String },

  #[error("internal server error: {0}")]
  Internal(#[from] anyhow::Error),
}

impl FocusError {
  pub fn source_rejected(tag: SourceRejectionTag, message: impl Into<String>) -> FocusError {
    FocusError::SourceRejected { tag, message: message.into() }
  }

  /// The tag carried by a `SourceRejected`, if this is one.
  pub fn source_rejection_tag(&self) -> Option<SourceRejectionTag> {
    match self {
      FocusError::SourceRejected { tag, .. } => Some(*tag),
      _ => None,
    }
  }

  /// The XMPP stanza-error condition this kind maps onto.
  pub fn stanza_condition(&self) -> &'static str {
    match self {
      FocusError::NotAuthorized => "not-authorized",
      FocusError::Forbidden => "forbidden",
      FocusError::NotAcceptable(_) => "not-acceptable",
      FocusError::BadRequest(_) => "bad-request",
      FocusError::SourceRejected { .. } => "bad-request",
      FocusError::ItemNotFound => "item-not-found",
      FocusError::ServiceUnavailable => "service-unavailable",
      FocusError::ResourceConstraint => "resource-constraint",
      FocusError::Conflict => "conflict",
      FocusError::Timeout => "remote-server-timeout",
      FocusError::NotConnected => "service-unavailable",
      FocusError::SessionInvalid => "item-not-found",
      FocusError::Reservation { .. } => "service-unavailable",
      FocusError::Internal(_) => "internal-server-error",
    }
  }

  /// The HTTP status this kind maps onto, for the `conference-request/v1` surface.
  pub fn http_status(&self) -> u16 {
    match self {
      FocusError::NotAuthorized => 401,
      FocusError::Forbidden => 403,
      FocusError::NotAcceptable(_) => 406,
      FocusError::BadRequest(_) => 400,
      FocusError::SourceRejected { .. } => 400,
      FocusError::ItemNotFound => 404,
      FocusError::ServiceUnavailable => 503,
      FocusError::ResourceConstraint => 429,
      FocusError::Conflict => 409,
      FocusError::Timeout => 504,
      FocusError::NotConnected => 503,
      FocusError::SessionInvalid => 410,
      FocusError::Reservation { code, .. } => *code,
      FocusError::Internal(_) => 500,
    }
  }
}

pub type Result<T> = std::result::Result<T, FocusError>;
