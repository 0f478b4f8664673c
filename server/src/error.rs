use actix_web::{body::BoxBody, http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid package name")]
    InvalidPackageName,

    #[error(transparent)]
    IndexNotFound(#[from] navigator::registry::errors::IndexNotFound),

    #[error("repository not found")]
    RepositoryNotFound,

    #[error(transparent)]
    Extract(#[from] navigator::source::git::errors::ExtractError),

    #[error(transparent)]
    Write(#[from] navigator::index::errors::WriteError),

    #[error(transparent)]
    Archive(#[from] navigator::archive::errors::ArchiveError),

    #[error("request cancelled")]
    Cancelled,
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidPackageName | Error::IndexNotFound(_) | Error::RepositoryNotFound => {
                StatusCode::NOT_FOUND
            }
            Error::Extract(e) if e.not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse<BoxBody> {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("request failed: {self}");
        }
        HttpResponse::build(status).body(self.to_string())
    }
}
