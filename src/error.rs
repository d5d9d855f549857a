//! Error taxonomy for the remote sync protocol.

use thiserror::Error;

/// Errors raised by the remote sync client.
///
/// The set is closed: every failure the transport can observe maps onto one
/// of these variants. Only transport-level `Network` failures are retried.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
  /// Credential rejected (401/403).
  #[error("authentication failed: {0}")]
  Authentication(String),

  /// 403 whose body points at the license rather than the credential.
  #[error("license expired: {0}")]
  LicenseExpired(String),

  /// Transient transport failure, or a non-2xx response outside the
  /// classified statuses (in which case `status` is set).
  #[error("network error: {message}")]
  Network {
    message: String,
    status: Option<u16>,
  },

  /// Base URL or API key missing. Raised before any request is attempted.
  #[error("sync client not configured: {0}")]
  NotConfigured(String),

  /// 409 carrying a version-prefixed error code.
  #[error("version conflict ({code}): {message}")]
  Version { code: String, message: String },

  /// 429.
  #[error("quota exceeded: {0}")]
  Quota(String),

  /// 2xx response whose body could not be decoded.
  #[error("invalid response: {0}")]
  InvalidResponse(String),
}

impl SyncError {
  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      message: message.into(),
      status: None,
    }
  }

  /// Network-class failure: transport errors and the not-configured state.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network { .. } | Self::NotConfigured(_))
  }

  /// Whether the failure may succeed if the same request is sent again.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Network { status: None, .. })
  }

  /// Authentication-class failure: terminal until credentials change.
  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Authentication(_) | Self::LicenseExpired(_))
  }
}
