#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Settings(#[from] conntrack_settings::SettingsError),

    #[error("{0}")]
    Relay(#[from] crate::relay::RelayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
