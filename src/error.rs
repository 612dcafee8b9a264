//! Error taxonomy shared across subsystems.
//!
//! Each leaf error type is a `thiserror` enum with constructor helper
//! methods rather than blanket `From` impls, following the same
//! rationale as the download module this crate grew out of: context
//! (resource, endpoint, artifact id, …) belongs in the error at the
//! point it is raised, not reconstructed later from a bare source error.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the rate limiter.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The bucket for `resource` is exhausted and the caller's deadline
    /// would be exceeded waiting for it to reset.
    #[error("rate limited on resource {resource}, resets in {reset_in:?}")]
    Exhausted {
        /// The rate-limited resource (core / search / graphql / endpoint label).
        resource: String,
        /// Time remaining until the bucket resets.
        reset_in: Duration,
    },
}

impl RateLimitError {
    /// Creates an `Exhausted` error for the given resource.
    pub fn exhausted(resource: impl Into<String>, reset_in: Duration) -> Self {
        Self::Exhausted {
            resource: resource.into(),
            reset_in,
        }
    }

    /// Rate-limit errors are always retryable once the window resets.
    #[must_use]
    pub fn retryable(&self) -> bool {
        true
    }
}

/// Errors raised by the circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit for `label` is open; the call was not attempted.
    #[error("circuit open for {label}")]
    Open {
        /// The upstream label this breaker guards.
        label: String,
    },
    /// The wrapped operation ran and failed.
    #[error(transparent)]
    Inner(#[from] E),
}

impl<E> BreakerError<E> {
    /// Creates an `Open` error for the given upstream label.
    pub fn open(label: impl Into<String>) -> Self {
        Self::Open {
            label: label.into(),
        }
    }

    /// Open errors are retryable after `openDuration`; inner errors defer
    /// to the wrapped error's own classification, which callers provide
    /// via `is_inner_retryable`.
    #[must_use]
    pub fn retryable(&self, is_inner_retryable: impl FnOnce(&E) -> bool) -> bool {
        match self {
            Self::Open { .. } => true,
            Self::Inner(e) => is_inner_retryable(e),
        }
    }
}

/// Errors raised by the priority request queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue has reached `maxSize` and will not accept more entries.
    #[error("queue full (max size {max_size})")]
    Full {
        /// The configured maximum queue size.
        max_size: usize,
    },
    /// The entry's individual timeout elapsed before it was dispatched.
    #[error("queue entry timed out after {waited:?}")]
    Timeout {
        /// How long the entry waited before timing out.
        waited: Duration,
    },
    /// The queue is shutting down and no longer accepts or dispatches work.
    #[error("queue unavailable (shutting down)")]
    Unavailable,
    /// A job for this correlation id is already queued or processing; at
    /// most one job per correlation id may be in flight at a time.
    #[error("job for correlation id {correlation_id} is already in flight")]
    DuplicateCorrelationId {
        /// The correlation id already in flight.
        correlation_id: String,
    },
}

impl QueueError {
    /// Creates a `Full` error for the given bound.
    #[must_use]
    pub fn full(max_size: usize) -> Self {
        Self::Full { max_size }
    }

    /// Creates a `Timeout` error for the given wait duration.
    #[must_use]
    pub fn timeout(waited: Duration) -> Self {
        Self::Timeout { waited }
    }

    /// Creates a `DuplicateCorrelationId` error.
    #[must_use]
    pub fn duplicate_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self::DuplicateCorrelationId {
            correlation_id: correlation_id.into(),
        }
    }

    /// All queue errors are retryable: `Full`/`Timeout` by the caller
    /// backing off and re-enqueuing, `Unavailable` once shutdown completes.
    #[must_use]
    pub fn retryable(&self) -> bool {
        true
    }
}

/// Errors raised by the platform client.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Underlying HTTP transport error.
    #[error("network error calling {endpoint}: {source}")]
    Network {
        /// The logical endpoint being called.
        endpoint: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The request did not complete before its deadline.
    #[error("timeout calling {endpoint}")]
    RequestTimeout {
        /// The logical endpoint being called.
        endpoint: String,
    },
    /// The platform rejected the credentials or token.
    #[error("authentication failed calling {endpoint}")]
    AuthenticationFailed {
        /// The logical endpoint being called.
        endpoint: String,
    },
    /// Webhook signature did not verify.
    #[error("webhook signature verification failed")]
    WebhookVerificationFailed,
    /// A request path contained `..` or `//` and was rejected before dispatch.
    #[error("permission denied: suspicious path {path}")]
    PermissionDenied {
        /// The rejected path.
        path: String,
    },
    /// Rate limiter declined to let the request proceed in time.
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    /// Circuit breaker short-circuited the request.
    #[error(transparent)]
    CircuitOpen(#[from] BreakerError<Box<PlatformError>>),
    /// The priority queue rejected or timed out the request.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl PlatformError {
    /// Creates a `Network` error from a reqwest error.
    pub fn network(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Creates a `RequestTimeout` error.
    #[must_use]
    pub fn request_timeout(endpoint: impl Into<String>) -> Self {
        Self::RequestTimeout {
            endpoint: endpoint.into(),
        }
    }

    /// Creates an `AuthenticationFailed` error.
    #[must_use]
    pub fn authentication_failed(endpoint: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            endpoint: endpoint.into(),
        }
    }

    /// Creates a `PermissionDenied` error for a rejected path.
    #[must_use]
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied { path: path.into() }
    }

    /// Transient classes (rate limit, circuit, queue, timeout, network) are
    /// retryable; auth, webhook, and permission errors are not.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::RequestTimeout { .. } | Self::Queue(_) => true,
            Self::RateLimited(e) => e.retryable(),
            Self::CircuitOpen(e) => e.retryable(|inner| inner.retryable()),
            Self::AuthenticationFailed { .. }
            | Self::WebhookVerificationFailed
            | Self::PermissionDenied { .. } => false,
        }
    }
}

/// Errors raised while handling an inbound webhook delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Signature verification failed.
    #[error(transparent)]
    Verification(#[from] PlatformError),
    /// The body didn't parse as the expected event shape.
    #[error("malformed webhook payload: {reason}")]
    MalformedPayload {
        /// Why the payload was rejected.
        reason: String,
    },
}

impl WebhookError {
    /// Creates a `MalformedPayload` error.
    #[must_use]
    pub fn malformed_payload(reason: impl Into<String>) -> Self {
        Self::MalformedPayload { reason: reason.into() }
    }
}

/// Errors raised by the artifact handler.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Downloaded content exceeded `maxSizeBytes`.
    #[error("artifact {name} exceeded max size {max_size_bytes} bytes")]
    TooLarge {
        /// The artifact's name.
        name: String,
        /// The configured size cap.
        max_size_bytes: u64,
    },
    /// The signed download URL expired before the request completed.
    #[error("artifact {name} download URL expired")]
    Expired {
        /// The artifact's name.
        name: String,
    },
    /// Leading bytes did not match the ZIP magic number.
    #[error("artifact {name} is not a valid ZIP (bad magic)")]
    InvalidZip {
        /// The artifact's name.
        name: String,
    },
    /// The signed URL did not parse, or did not use `https`.
    #[error("artifact {name} download URL is not a trusted https URL")]
    UntrustedUrl {
        /// The artifact's name.
        name: String,
    },
    /// Underlying network error while downloading.
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl ArtifactError {
    /// Creates a `TooLarge` error.
    #[must_use]
    pub fn too_large(name: impl Into<String>, max_size_bytes: u64) -> Self {
        Self::TooLarge {
            name: name.into(),
            max_size_bytes,
        }
    }

    /// Creates an `Expired` error.
    #[must_use]
    pub fn expired(name: impl Into<String>) -> Self {
        Self::Expired { name: name.into() }
    }

    /// Creates an `InvalidZip` error.
    #[must_use]
    pub fn invalid_zip(name: impl Into<String>) -> Self {
        Self::InvalidZip { name: name.into() }
    }

    /// Creates an `UntrustedUrl` error.
    #[must_use]
    pub fn untrusted_url(name: impl Into<String>) -> Self {
        Self::UntrustedUrl { name: name.into() }
    }

    /// `Expired` is retryable (re-resolve the URL); size/zip/url errors are not.
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Expired { .. } => true,
            Self::TooLarge { .. } | Self::InvalidZip { .. } | Self::UntrustedUrl { .. } => false,
            Self::Platform(e) => e.retryable(),
        }
    }
}

/// Errors raised by the JUnit parser.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed XML, or a hard limit (depth, size) was exceeded.
    #[error("failed to parse {source_name}: {reason}")]
    ParseFailed {
        /// The file or entry name being parsed.
        source_name: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Format detection produced no usable handler.
    #[error("unsupported format for {source_name}")]
    UnsupportedFormat {
        /// The file or entry name being parsed.
        source_name: String,
    },
    /// Parsed successfully but failed count-reconciliation validation.
    #[error("validation failed for {source_name}: {reason}")]
    ValidationFailed {
        /// The file or entry name being parsed.
        source_name: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl ParseError {
    /// Creates a `ParseFailed` error.
    #[must_use]
    pub fn parse_failed(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParseFailed {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `UnsupportedFormat` error.
    #[must_use]
    pub fn unsupported_format(source_name: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            source_name: source_name.into(),
        }
    }

    /// Creates a `ValidationFailed` error.
    #[must_use]
    pub fn validation_failed(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailed {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Parser errors are never retried: the same bytes parse the same way
    /// every time. Callers isolate them as per-artifact warnings instead.
    #[must_use]
    pub fn retryable(&self) -> bool {
        false
    }
}

/// Errors raised by the ingestion coordinator.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The platform client failed in a way the job cannot recover from.
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// The artifact handler failed in a way the job cannot recover from.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// No artifact in the run qualified or parsed successfully.
    #[error("no qualifying test-report artifacts found for run {external_run_id}")]
    NoArtifacts {
        /// The workflow run's external id.
        external_run_id: String,
    },
}

impl IngestError {
    #[must_use]
    pub fn retryable(&self) -> bool {
        match self {
            Self::Platform(e) => e.retryable(),
            Self::Artifact(e) => e.retryable(),
            Self::NoArtifacts { .. } => false,
        }
    }
}
