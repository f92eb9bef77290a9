//! Error classification for retry decisions.
//!
//! # Order
//! 1. Variants of [`ReliabilityError`] that carry their own meaning.
//! 2. Typed rules, walked over the whole `source()` chain.
//! 3. Message keyword heuristics.
//! 4. Default: `Retryable`.

use std::error::Error as StdError;
use std::io;

use crate::error::{ClassifiedError, ErrorKind, ReliabilityError};

// Earlier keywords win: "gateway timeout" is a timeout, not a server error.
const DEFAULT_KEYWORDS: &[(&str, ErrorKind)] = &[
    ("rate limit", ErrorKind::RateLimited),
    ("too many requests", ErrorKind::RateLimited),
    ("throttl", ErrorKind::RateLimited),
    ("429", ErrorKind::RateLimited),
    ("timed out", ErrorKind::Timeout),
    ("timeout", ErrorKind::Timeout),
    ("deadline exceeded", ErrorKind::Timeout),
    ("connection", ErrorKind::Network),
    ("network", ErrorKind::Network),
    ("unreachable", ErrorKind::Network),
    ("dns", ErrorKind::Network),
    ("broken pipe", ErrorKind::Network),
    ("internal server error", ErrorKind::ServerError),
    ("service unavailable", ErrorKind::ServerError),
    ("bad gateway", ErrorKind::ServerError),
    ("500", ErrorKind::ServerError),
    ("502", ErrorKind::ServerError),
    ("503", ErrorKind::ServerError),
    ("504", ErrorKind::ServerError),
];

type TypeRule = Box<dyn Fn(&(dyn StdError + 'static)) -> Option<ErrorKind> + Send + Sync>;

/// Maps errors to an [`ErrorKind`].
pub struct ErrorClassifier {
    type_rules: Vec<TypeRule>,
    keyword_rules: Vec<(String, ErrorKind)>,
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("type_rules", &self.type_rules.len())
            .field("keyword_rules", &self.keyword_rules)
            .finish()
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ErrorClassifier {
    /// Classifier without any rules; everything is `Retryable`.
    pub fn empty() -> Self {
        Self {
            type_rules: Vec::new(),
            keyword_rules: Vec::new(),
        }
    }

    /// Classifier with the built-in type and keyword tables.
    pub fn with_defaults() -> Self {
        let mut classifier = Self::empty();

        classifier.register_rule(|e| e.downcast_ref::<ClassifiedError>().map(|c| c.kind));
        classifier.register_rule(|e| e.downcast_ref::<io::Error>().and_then(classify_io));
        classifier.register_type::<tokio::time::error::Elapsed>(ErrorKind::Timeout);

        for (keyword, kind) in DEFAULT_KEYWORDS {
            classifier.register_keyword(keyword, *kind);
        }
        classifier
    }

    /// Classify every error of type `E` (anywhere in the source chain) as `kind`.
    pub fn register_type<E>(&mut self, kind: ErrorKind) -> &mut Self
    where
        E: StdError + 'static,
    {
        self.type_rules
            .push(Box::new(move |e| if e.is::<E>() { Some(kind) } else { None }));
        self
    }

    /// Register an arbitrary typed rule. Rules are consulted in registration order.
    pub fn register_rule<F>(&mut self, rule: F) -> &mut Self
    where
        F: Fn(&(dyn StdError + 'static)) -> Option<ErrorKind> + Send + Sync + 'static,
    {
        self.type_rules.push(Box::new(rule));
        self
    }

    /// Classify errors whose message contains `keyword` (case-insensitive).
    pub fn register_keyword(&mut self, keyword: &str, kind: ErrorKind) -> &mut Self {
        self.keyword_rules.push((keyword.to_lowercase(), kind));
        self
    }

    pub fn classify(&self, error: &ReliabilityError) -> ErrorKind {
        match error {
            ReliabilityError::RateLimited { .. } => ErrorKind::RateLimited,
            ReliabilityError::Timeout { .. } => ErrorKind::Timeout,
            ReliabilityError::NoInstanceAvailable { .. } => ErrorKind::Retryable,
            ReliabilityError::CircuitOpen { .. }
            | ReliabilityError::RetriesExhausted { .. }
            | ReliabilityError::FallbackFailed(_) => ErrorKind::NonRetryable,
            ReliabilityError::Operation(inner) => self.classify_error(inner.as_ref()),
        }
    }

    /// Classify a raw error by walking its source chain.
    pub fn classify_error(&self, error: &(dyn StdError + 'static)) -> ErrorKind {
        let mut current = Some(error);
        while let Some(err) = current {
            if let Some(nested) = err.downcast_ref::<ReliabilityError>() {
                return self.classify(nested);
            }
            if let Some(kind) = self.type_rules.iter().find_map(|rule| rule(err)) {
                return kind;
            }
            current = err.source();
        }

        let mut message = error.to_string().to_lowercase();
        let mut source = error.source();
        while let Some(err) = source {
            message.push(' ');
            message.push_str(&err.to_string().to_lowercase());
            source = err.source();
        }

        self.keyword_rules
            .iter()
            .find(|(keyword, _)| message.contains(keyword.as_str()))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Retryable)
    }
}

fn classify_io(error: &io::Error) -> Option<ErrorKind> {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::TimedOut => Some(ErrorKind::Timeout),
        Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::AddrNotAvailable => Some(ErrorKind::Network),
        Io::PermissionDenied | Io::InvalidInput | Io::InvalidData | Io::NotFound | Io::Unsupported => {
            Some(ErrorKind::NonRetryable)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;

    #[derive(Debug, thiserror::Error)]
    #[error("order rejected by venue")]
    struct OrderRejected;

    #[derive(Debug, thiserror::Error)]
    #[error("submit failed")]
    struct SubmitFailed(#[source] OrderRejected);

    fn op_err(e: impl Into<BoxError>) -> ReliabilityError {
        ReliabilityError::Operation(e.into())
    }

    #[test]
    fn test_explicit_kind_wins() {
        let c = ErrorClassifier::default();
        let err: ReliabilityError = ClassifiedError::non_retryable("connection refused").into();
        assert_eq!(c.classify(&err), ErrorKind::NonRetryable);
    }

    #[test]
    fn test_io_errors() {
        let c = ErrorClassifier::default();
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(c.classify(&refused.into()), ErrorKind::Network);
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(c.classify(&denied.into()), ErrorKind::NonRetryable);
    }

    #[test]
    fn test_keywords() {
        let c = ErrorClassifier::default();
        assert_eq!(c.classify(&op_err("HTTP 429 Too Many Requests")), ErrorKind::RateLimited);
        assert_eq!(c.classify(&op_err("request timed out")), ErrorKind::Timeout);
        assert_eq!(c.classify(&op_err("504 gateway timeout")), ErrorKind::Timeout);
        assert_eq!(c.classify(&op_err("503 Service Unavailable")), ErrorKind::ServerError);
        assert_eq!(c.classify(&op_err("network is unreachable")), ErrorKind::Network);
        assert_eq!(c.classify(&op_err("something odd")), ErrorKind::Retryable);
    }

    #[test]
    fn test_registered_type_found_in_source_chain() {
        let mut c = ErrorClassifier::default();
        c.register_type::<OrderRejected>(ErrorKind::NonRetryable);
        assert_eq!(c.classify(&op_err(SubmitFailed(OrderRejected))), ErrorKind::NonRetryable);
    }

    #[test]
    fn test_protection_variants_are_final() {
        let c = ErrorClassifier::default();
        let open = ReliabilityError::CircuitOpen { name: "cb".into() };
        assert_eq!(c.classify(&open), ErrorKind::NonRetryable);
        let fb = ReliabilityError::FallbackFailed("boom".into());
        assert_eq!(c.classify(&fb), ErrorKind::NonRetryable);
    }
}
