use ccq_auth::AuthenticationError;
use ccq_auth::AuthorizationError;
use ccq_auth::SignatureError;
use ccq_executors::ExecutionError;
use ccq_executors::RegistryError;
use ccq_messages::DecodeError;
use ccq_messages::EncodeError;
use thiserror::Error;
use warp::http::StatusCode;

/// Why a query was not answered.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("failed to decode query request: {0}")]
    Decode(#[from] DecodeError),

    #[error("request signature is missing")]
    MissingSignature,

    #[error("invalid request signature: {0}")]
    InvalidSignature(SignatureError),

    #[error("failed to sign: {0}")]
    Signing(SignatureError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("failed to encode query response: {0}")]
    Encode(#[from] EncodeError),
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Authorization(err) => GatewayError::Authorization(err),
            RegistryError::Execution(err) => GatewayError::Execution(err),
        }
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_)
            | GatewayError::Authorization(_)
            | GatewayError::InvalidBody(_)
            | GatewayError::Decode(_)
            | GatewayError::MissingSignature
            | GatewayError::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            GatewayError::Execution(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Execution(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            GatewayError::Execution(_) | GatewayError::Signing(_) | GatewayError::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Label used for the rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::Authentication(_) => "authentication",
            GatewayError::Authorization(_) => "authorization",
            GatewayError::InvalidBody(_) | GatewayError::Decode(_) => "decode",
            GatewayError::MissingSignature | GatewayError::InvalidSignature(_) => "signature",
            GatewayError::Execution(err) if err.is_timeout() => "timeout",
            GatewayError::Execution(_) => "execution",
            GatewayError::Signing(_) | GatewayError::Encode(_) => "internal",
        }
    }
}
