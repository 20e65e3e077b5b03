use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("record source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("first page of the iterative collection failed: {0}")]
    FirstPageFailed(#[source] ServiceError),
}

