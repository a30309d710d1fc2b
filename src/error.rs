use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

const GENERIC_CLIENT_MESSAGE: &str = "An unexpected error occurred";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The completion backend or a storefront API failed or returned nothing usable.
    #[error("upstream error: {message}")]
    Upstream { message: String, client_message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
            client_message: GENERIC_CLIENT_MESSAGE.to_string(),
        }
    }

    /// Upstream failure whose client-facing text is allowed to say what failed.
    pub fn upstream_with_client_message(
        msg: impl Into<String>,
        client_message: impl Into<String>,
    ) -> Self {
        Self::Upstream {
            message: msg.into(),
            client_message: client_message.into(),
        }
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Numeric code sent with the `error` event.
    pub fn code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::Upstream { .. } => 500,
            Self::Database(_) => 500,
            Self::Config(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// Text that may cross the wire. Internal detail never does.
    pub fn client_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::Unauthorized(msg) | Self::NotFound(msg) => msg.clone(),
            Self::Upstream { client_message, .. } => client_message.clone(),
            Self::Database(_) | Self::Config(_) | Self::Internal(_) => {
                GENERIC_CLIENT_MESSAGE.to_string()
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::upstream(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("malformed payload: {err}"))
    }
}

/// Result of a collaborator call whose failure may be soft.
///
/// `Degraded` carries a usable fallback value; `Fatal` must abort the caller.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Degraded { value: T, reason: String },
    Fatal(AppError),
}

impl<T> Outcome<T> {
    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Self::Degraded {
            value,
            reason: reason.into(),
        }
    }

    /// Substitutes `fallback` for transient failures. Rejected credentials stay `Fatal`.
    pub fn or_degrade(result: Result<T>, fallback: impl FnOnce() -> T) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err @ AppError::Unauthorized(_)) => Self::Fatal(err),
            Err(err) => Self::degraded(fallback(), err.to_string()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// Usable value for soft paths; `Fatal` becomes an error.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Ok(value) | Self::Degraded { value, .. } => Ok(value),
            Self::Fatal(err) => Err(err),
        }
    }
}
