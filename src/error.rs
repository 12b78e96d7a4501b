use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Client Error - {0}")]
    Client(String),

    #[error("Producer Error - {0}")]
    Producer(String),

    #[error("OffsetManager Error - {0}")]
    OffsetManager(String),

    #[error("Runtime Error - {0}")]
    Runtime(String),
}
