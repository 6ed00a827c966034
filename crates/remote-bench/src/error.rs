use thiserror::Error;

use crate::{
    auth::AuthError,
    command::CommandError,
    config::{ConfigError, FileError},
    logs::ParseError,
    remote::{ExecError, GroupError},
    settings::SettingsError,
    transfer::TransferError,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error("local file system: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
    /// A failure wrapped with what the driver was doing at the time.
    #[error("{message}: {source}")]
    Bench {
        message: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn context(self, message: &'static str) -> Self {
        Self::Bench {
            message,
            source: Box::new(self),
        }
    }

    /// Errors a sweep cannot recover from by moving on to the next point.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Config(_) | Self::Settings(_) | Self::Auth(_) => true,
            Self::Bench { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

/// Attach a message to the error of a result, converting it into [`Error`].
pub trait Context<T> {
    fn context(self, message: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for std::result::Result<T, E> {
    fn context(self, message: &'static str) -> Result<T> {
        self.map_err(|e| Into::<Error>::into(e).context(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_the_message() {
        let group = GroupError {
            host: "h".to_owned(),
            message: "boom".to_owned(),
            failed: 1,
            total: 2,
        };
        let result: std::result::Result<(), _> = Err(group);
        let error = result.context("Failed to update nodes").unwrap_err();
        assert_eq!(
            error.to_string(),
            "Failed to update nodes: h: boom (1 of 2 hosts failed)"
        );
        assert!(!error.is_configuration());
    }

    #[test]
    fn configuration_errors_are_recognised_through_context() {
        let error =
            Error::from(ConfigError::MissingRate).context("Invalid nodes or bench parameters");
        assert!(error.is_configuration());
    }
}
