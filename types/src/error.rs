// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the warden engine.
//!
//! These errors may be generated while handling a dispatch (local or
//! remote) or during background operation. When generated as part of an
//! HTTP request they are converted to an HTTP error as one of the last
//! steps in processing, so the rest of the system stays agnostic to the
//! transport.

use dropshot::HttpError;
use dropshot::HttpErrorResponseBody;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// An error generated within the warden engine.
///
/// Where possible we reuse existing variants rather than inventing new ones
/// to distinguish cases no programmatic consumer needs to distinguish.
#[derive(
    Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize, JsonSchema,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Error {
    /// The request was malformed: empty resource ids, an unknown
    /// namespace or relation at the pinned revision, and so on.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The depth budget reached zero before resolution completed. Fatal
    /// for the sub-request; bubbles to the root.
    #[error(
        "the dispatch depth budget was exhausted; the schema may contain a \
         cycle reachable from this relation"
    )]
    DepthExceeded,

    /// Storage reports the pinned revision is no longer available. The
    /// caller may retry at the head revision.
    #[error("revision {revision} is no longer available")]
    RevisionStale { revision: String },

    /// An RPC to the target peer failed after bounded retries, re-hash,
    /// and local fallback.
    #[error("peer {peer} unavailable: {message}")]
    PeerUnavailable { peer: String, message: String },

    /// The caller went away; propagated transparently.
    #[error("request canceled")]
    Canceled,

    /// The request-scoped deadline elapsed; propagated transparently.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An invariant violation. Non-recoverable; logged with full context
    /// at the point of generation.
    #[error("internal error: {internal_message}")]
    Internal { internal_message: String },
}

impl Error {
    /// Returns whether the error is likely transient and could reasonably
    /// be retried (for streams: resumed from the last cursor).
    pub fn retryable(&self) -> bool {
        match self {
            Error::PeerUnavailable { .. } | Error::DeadlineExceeded => true,

            Error::InvalidArgument { .. }
            | Error::DepthExceeded
            | Error::RevisionStale { .. }
            | Error::Canceled
            | Error::Internal { .. } => false,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Error {
        Error::InvalidArgument { message: message.into() }
    }

    /// Generates an [`Error::InvalidArgument`] for a `(namespace, relation)`
    /// pair unknown at the pinned revision.
    pub fn unknown_relation(namespace: &str, relation: &str) -> Error {
        Error::InvalidArgument {
            message: format!(
                "relation {}#{} is not defined at this revision",
                namespace, relation
            ),
        }
    }

    /// Generates an [`Error::Internal`] with the specified message.
    ///
    /// Internal errors are for operational conditions that should not
    /// happen but that we cannot reasonably handle at runtime (e.g. a
    /// cache entry deserializing to the wrong response type).
    pub fn internal(internal_message: impl Into<String>) -> Error {
        Error::Internal { internal_message: internal_message.into() }
    }

    /// The machine-readable code carried in the HTTP `error_code` field.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument { .. } => "InvalidArgument",
            Error::DepthExceeded => "DepthExceeded",
            Error::RevisionStale { .. } => "RevisionStale",
            Error::PeerUnavailable { .. } => "PeerUnavailable",
            Error::Canceled => "Canceled",
            Error::DeadlineExceeded => "DeadlineExceeded",
            Error::Internal { .. } => "InternalError",
        }
    }

    /// Given an error returned in an HTTP response from a peer,
    /// reconstitute the `Error` it describes, preserving the kind across
    /// the hop. Unknown codes become internal errors.
    pub fn from_response(
        error_message_base: &str,
        error_response: HttpErrorResponseBody,
    ) -> Error {
        let message = error_response.message.clone();
        match error_response.error_code.as_deref() {
            Some("InvalidArgument") => Error::InvalidArgument { message },
            Some("DepthExceeded") => Error::DepthExceeded,
            Some("RevisionStale") => {
                Error::RevisionStale { revision: message }
            }
            Some("PeerUnavailable") => Error::PeerUnavailable {
                peer: String::from("(upstream)"),
                message,
            },
            Some("Canceled") => Error::Canceled,
            Some("DeadlineExceeded") => Error::DeadlineExceeded,
            _ => Error::Internal {
                internal_message: format!(
                    "{}: unknown error from peer: {:?}",
                    error_message_base, error_response
                ),
            },
        }
    }
}

impl From<Error> for HttpError {
    /// Defines how engine errors are exposed over the peer RPC surface.
    fn from(error: Error) -> HttpError {
        let code = error.code();
        let message = error.to_string();
        match error {
            Error::InvalidArgument { .. }
            | Error::DepthExceeded
            | Error::RevisionStale { .. } => HttpError::for_client_error(
                Some(String::from(code)),
                dropshot::ClientErrorStatusCode::BAD_REQUEST,
                message,
            ),

            Error::PeerUnavailable { .. } => {
                let mut err = HttpError::for_unavail(
                    Some(String::from(code)),
                    message.clone(),
                );
                // Warden is an internal service; surface the detail to the
                // (peer) caller rather than hiding it.
                err.external_message = message;
                err
            }

            Error::Canceled => {
                // 499: client closed request. No named constant exists
                // for it, but it is a valid status code.
                let status = http::StatusCode::from_u16(499)
                    .expect("499 is a valid status code");
                HttpError {
                    status_code: dropshot::ErrorStatusCode::try_from(status)
                        .expect("499 is a valid error status code"),
                    error_code: Some(String::from(code)),
                    external_message: message.clone(),
                    internal_message: message,
                    headers: None,
                }
            }

            Error::DeadlineExceeded => HttpError {
                status_code: dropshot::ErrorStatusCode::try_from(
                    http::StatusCode::GATEWAY_TIMEOUT,
                )
                .expect("504 is a valid error status code"),
                error_code: Some(String::from(code)),
                external_message: message.clone(),
                internal_message: message,
                headers: None,
            },

            Error::Internal { internal_message } => {
                HttpError::for_internal_error(internal_message)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn test_retryable() {
        assert!(Error::PeerUnavailable {
            peer: "p1".into(),
            message: "connection refused".into()
        }
        .retryable());
        assert!(Error::DeadlineExceeded.retryable());
        assert!(!Error::DepthExceeded.retryable());
        assert!(!Error::invalid_argument("nope").retryable());
        assert!(!Error::internal("broken").retryable());
    }

    #[test]
    fn test_cancellation_and_deadline_statuses_differ() {
        let canceled = dropshot::HttpError::from(Error::Canceled);
        let deadline = dropshot::HttpError::from(Error::DeadlineExceeded);
        assert_eq!(canceled.status_code.as_u16(), 499);
        assert_eq!(deadline.status_code.as_u16(), 504);
        assert_ne!(canceled.status_code, deadline.status_code);
    }

    #[test]
    fn test_code_round_trip() {
        let errors = [
            Error::invalid_argument("bad"),
            Error::DepthExceeded,
            Error::Canceled,
            Error::DeadlineExceeded,
        ];
        for error in errors {
            let body = dropshot::HttpErrorResponseBody {
                request_id: String::from("test"),
                error_code: Some(error.code().to_string()),
                message: error.to_string(),
            };
            let round_tripped = Error::from_response("test", body);
            assert_eq!(round_tripped.code(), error.code());
        }
    }
}
