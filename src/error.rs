//! Fault taxonomy for the sync engine.
//!
//! Response bodies are classified once, where the HTTP call returns, into a
//! [`FaultBody`]. Nothing downstream re-parses them.

use serde_json::Value;

/// Body of a failed HTTP exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultBody {
    Json(Value),
    Raw(String),
    Empty,
}

impl FaultBody {
    /// Classify a raw response body.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return FaultBody::Empty;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(v) => FaultBody::Json(v),
            Err(_) => FaultBody::Raw(trimmed.to_string()),
        }
    }

    /// The `error` message of a JSON body, if it carries one.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            FaultBody::Json(v) => v
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| v.pointer("/response/error").and_then(Value::as_str)),
            _ => None,
        }
    }
}

impl std::fmt::Display for FaultBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultBody::Json(v) => write!(f, "{v}"),
            FaultBody::Raw(s) => f.write_str(s),
            FaultBody::Empty => f.write_str("<empty>"),
        }
    }
}

/// A failed HTTP exchange after the retry policy has run its course.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpFault {
    #[error("no response from {url} ({message}) - possibly a remote server crash")]
    NoResponse { url: String, message: String },

    #[error("{url} responded with {status} after {attempts} attempt(s): {body}")]
    Status {
        url: String,
        status: u16,
        body: FaultBody,
        attempts: u32,
    },

    #[error("unable to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl HttpFault {
    /// Attempts beyond the first one that were spent before giving up.
    pub fn retries(&self) -> u32 {
        match self {
            HttpFault::Status { attempts, .. } => attempts.saturating_sub(1),
            _ => 0,
        }
    }
}

/// Upstream feed call failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamFault {
    /// The feed could not resolve a cursor for the requested position.
    #[error("no anchor found: {message}")]
    AnchorNotFound { message: String },

    #[error(transparent)]
    Http(#[from] HttpFault),
}

/// Downstream store call failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreFault {
    #[error("unable to read latest posting: {0}")]
    Latest(#[source] HttpFault),

    #[error("unable to upsert chunk {chunk} ({size} postings): {fault}")]
    Upsert {
        chunk: usize,
        size: usize,
        #[source]
        fault: HttpFault,
    },

    #[error("unable to remove posting {id}: {fault}")]
    Remove {
        id: String,
        #[source]
        fault: HttpFault,
    },
}

impl StoreFault {
    pub fn http(&self) -> &HttpFault {
        match self {
            StoreFault::Latest(fault) => fault,
            StoreFault::Upsert { fault, .. } => fault,
            StoreFault::Remove { fault, .. } => fault,
        }
    }
}

/// Startup-only failures. Fatal to the process.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigFault {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    #[error("invalid configuration value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("unable to parse cadence expression {0:?}")]
    Cadence(String),

    #[error("exactly one of metro or state must be set for the polling location")]
    Location,
}

/// Anything that ends a sync cycle early.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CycleFault {
    #[error(transparent)]
    Upstream(#[from] UpstreamFault),

    #[error(transparent)]
    Store(#[from] StoreFault),
}

impl CycleFault {
    pub fn is_anchor_not_found(&self) -> bool {
        matches!(self, CycleFault::Upstream(UpstreamFault::AnchorNotFound { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_classified_once() {
        assert_eq!(FaultBody::from_text("   "), FaultBody::Empty);
        assert_eq!(
            FaultBody::from_text("<html>bad gateway</html>"),
            FaultBody::Raw("<html>bad gateway</html>".into())
        );
        let b = FaultBody::from_text(r#"{"error":"No anchor found"}"#);
        assert_eq!(b.error_message(), Some("No anchor found"));
    }

    #[test]
    fn nested_response_error_is_found() {
        let b = FaultBody::from_text(r#"{"response":{"error":"nope"}}"#);
        assert_eq!(b.error_message(), Some("nope"));
        assert_eq!(FaultBody::Raw("x".into()).error_message(), None);
    }

    #[test]
    fn retries_exclude_first_attempt() {
        let f = HttpFault::Status {
            url: "http://x".into(),
            status: 503,
            body: FaultBody::Empty,
            attempts: 5,
        };
        assert_eq!(f.retries(), 4);
        let n = HttpFault::NoResponse {
            url: "http://x".into(),
            message: "refused".into(),
        };
        assert_eq!(n.retries(), 0);
    }
}
