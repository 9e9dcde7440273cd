use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIGURATION_ERROR: {0}")]
    Configuration(String),
    #[error("VALIDATION_ERROR: {0}")]
    Validation(String),
    #[error("EXECUTION_ERROR: {0}")]
    Execution(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("STARTUP_ERROR: {0}")]
    Startup(String),
}

impl AppError {
    /// HTTP-equivalent status a caller should surface for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Configuration(_) => 400,
            Self::Validation(_) => 422,
            Self::NotFound(_) => 404,
            Self::Execution(_) | Self::Startup(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Startup(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Execution(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Validation(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
