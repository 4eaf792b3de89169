use mongodb::error::Error as DbError;
use redis::RedisError;
use rocket::{
    http::{Status, StatusClass},
    response::Responder,
    tokio::task::JoinError,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Voting not open: {0}")]
    VotingNotOpen(String),
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn authentication(what: impl Into<String>) -> Self {
        Self::Authentication(what.into())
    }

    /// Is this a validation failure caused by the caller, rather than by us?
    pub fn is_domain_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::VotingNotOpen(_)
                | Self::InvalidOption(_)
                | Self::BadRequest(_)
        )
    }
}

impl From<RedisError> for Error {
    fn from(err: RedisError) -> Self {
        Self::ServiceUnavailable(format!("shared store: {err}"))
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self::Internal(format!("worker task failed: {err}"))
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        let status = match self {
            Self::NotFound(_) => Status::NotFound,
            Self::VotingNotOpen(_) | Self::InvalidOption(_) | Self::BadRequest(_) => {
                Status::BadRequest
            }
            Self::ServiceUnavailable(_) => Status::ServiceUnavailable,
            Self::Authentication(_) | Self::Db(_) | Self::Internal(_) => {
                Status::InternalServerError
            }
        };
        match status.class() {
            StatusClass::ServerError => error!("{self}"),
            _ => debug!("{self}"),
        }
        Err(status)
    }
}
