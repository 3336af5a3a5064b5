use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dial to {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("PAC error: {0}")]
    Pac(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}
