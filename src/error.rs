use thiserror::Error;

/// Crate-wide error type. Library functions return `Result<T, Error>`;
/// binaries wrap the top-level call in `anyhow::Context` for startup
/// diagnostics.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("PVC {0}/{1} not found")]
    NotFound(String, String),

    #[error("PVC is not a clone request")]
    NotACloneRequest,

    #[error("invalid clone token: {0}")]
    InvalidToken(String),

    #[error("incompatible PVC: {0}")]
    IncompatiblePvc(String),

    #[error("PVC {0}/{1} is missing annotation {2}")]
    MissingAnnotation(String, String, &'static str),

    #[error("found {0} source pods for clone unique id {1}, expected at most one")]
    MultipleSourcePods(usize, String),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("upstream request error: {0}")]
    Upstream(#[from] reqwest::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A short, low-cardinality label for the reconcile-failure metric.
    pub fn metric_reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Finalizer(_) => "finalizer",
            Error::NotFound(..) => "not_found",
            Error::NotACloneRequest => "not_a_clone_request",
            Error::InvalidToken(_) => "invalid_token",
            Error::IncompatiblePvc(_) => "incompatible_pvc",
            Error::MissingAnnotation(..) => "missing_annotation",
            Error::MultipleSourcePods(..) => "multiple_source_pods",
            Error::Token(_) => "token",
            Error::Tls(_) => "tls",
            Error::Upstream(_) => "upstream",
        }
    }

    /// True for errors caused by the PVC's own request being malformed or
    /// incompatible, as opposed to a transient API/infrastructure failure.
    /// Validation errors are not worth retrying: the PVC needs an edit.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::NotACloneRequest
                | Error::InvalidToken(_)
                | Error::IncompatiblePvc(_)
                | Error::MissingAnnotation(..)
        )
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::Finalizer(Box::new(e))
    }
}

/// Failure kinds for [`crate::token`] validation. All of them are folded
/// into a single opaque [`TokenError::Invalid`] at the call site (callers
/// must not branch on kind to pick an HTTP status, per spec C1); the
/// variants exist purely so the signing/verification code can be unit
/// tested precisely.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token issuer does not match")]
    WrongIssuer,
    #[error("token is expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
}

impl TokenError {
    /// Collapse any validation failure into the single opaque error the
    /// spec requires callers to treat uniformly.
    pub fn opaque(&self) -> Error {
        Error::InvalidToken("token validation failed".to_string())
    }
}
