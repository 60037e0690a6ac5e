//! The operation result object.
//!
//! Every public operation answers with an [`OperationResult`], whether the
//! failure came from the server (a status code) or from this side (a pool
//! timeout, a dead node). The protocol status travels verbatim so callers
//! can react to exactly what the server said, and a get whose payload the
//! transcoder rejected still exposes the raw bytes.

use ember_core::Payload;
use ember_proto::Status;

use crate::error::ClientError;

/// Outcome of one client operation.
#[derive(Debug, Clone)]
pub struct OperationResult<T> {
    success: bool,
    value: Option<T>,
    cas: u64,
    status: Option<Status>,
    message: Option<String>,
    raw: Option<Payload>,
}

impl<T> OperationResult<T> {
    /// A successful outcome.
    pub(crate) fn ok(value: Option<T>, cas: u64) -> Self {
        Self {
            success: true,
            value,
            cas,
            status: Some(Status::NoError),
            message: None,
            raw: None,
        }
    }

    /// A server-reported failure, status preserved verbatim.
    pub(crate) fn server(status: Status, cas: u64, message: Option<String>) -> Self {
        Self {
            success: false,
            value: None,
            cas,
            status: Some(status),
            message,
            raw: None,
        }
    }

    /// A client-side failure; there is no protocol status to report.
    pub(crate) fn client(error: &ClientError) -> Self {
        Self {
            success: false,
            value: None,
            cas: 0,
            status: None,
            message: Some(error.to_string()),
            raw: None,
        }
    }

    /// Attaches the raw payload (undecodable gets keep their bytes).
    pub(crate) fn with_raw(mut self, raw: Payload) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Overrides the cas token.
    pub(crate) fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Whether the operation succeeded.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.success
    }

    /// The decoded value, when the operation yields one.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Consumes the result, returning the decoded value.
    #[must_use]
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// The item's cas token; 0 when the operation yields none.
    #[must_use]
    pub const fn cas(&self) -> u64 {
        self.cas
    }

    /// The server status, absent for client-side failures.
    #[must_use]
    pub const fn status(&self) -> Option<Status> {
        self.status
    }

    /// The protocol status code verbatim, absent for client-side failures.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.status.map(Status::code)
    }

    /// A human-readable failure description, when one exists.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The raw wire payload, kept when decoding failed.
    #[must_use]
    pub fn raw(&self) -> Option<&Payload> {
        self.raw.as_ref()
    }
}
