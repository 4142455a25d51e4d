use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream http error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream http status {0}")]
    UpstreamStatus(reqwest::StatusCode),

    #[error("narinfo parse error: {0}")]
    NarInfo(#[from] nardelta_protocol::NarInfoError),

    #[error("store path error: {0}")]
    StorePath(#[from] nardelta_store_core::StorePathError),

    #[error("diff algo error: {0}")]
    Delta(#[from] nardelta_delta::DeltaError),

    #[error("archive error: {0}")]
    Nar(#[from] nardelta_nar::NarError),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Extension trait for adding context to IO errors.
pub trait IoErrorContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> IoErrorContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| AppError::Io {
            context: context.into(),
            source: e,
        })
    }
}

/// Handler-level error: an [`AppError`] carried to the HTTP layer with an
/// explicit status code.
#[derive(Debug)]
pub struct ServerError {
    pub status: actix_web::http::StatusCode,
    pub err: AppError,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl actix_web::error::ResponseError for ServerError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.status
    }
}

impl From<AppError> for ServerError {
    fn from(err: AppError) -> ServerError {
        ServerError {
            status: actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl ServerError {
    pub fn with_status(status: actix_web::http::StatusCode, err: AppError) -> Self {
        Self { status, err }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into()).into()
    }
}

pub type ServerResult = std::result::Result<actix_web::HttpResponse, ServerError>;
