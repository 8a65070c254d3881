pub mod agent;
pub mod bpf;
pub mod config;
pub mod http;
pub mod links;
pub mod metrics;
pub mod resolver;
pub mod runtime;

use aya::EbpfError;
use aya::programs::ProgramError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    EbpfError(String),

    #[error("{0}")]
    EbpfProgramError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("map error: {0}")]
    MapError(#[from] aya::maps::MapError),

    #[error("program {name} not found")]
    ProgramNotFound { name: String },

    #[error("store error: {0}")]
    StoreError(#[from] buzzard_store::Error),

    #[error("docker api error: {0}")]
    DockerApi(String),

    #[error("http error: {0}")]
    HttpError(#[from] ::http::Error),

    #[error("hyper error: {0}")]
    HyperError(#[from] hyper::Error),

    #[error("http client error: {0}")]
    HttpClientError(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("event stream closed")]
    EventStreamClosed,

    #[error("system error: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::EbpfError(_) => "ebpf",
            Error::EbpfProgramError(_) => "ebpf_program",
            Error::IoError(_) => "io",
            Error::MapError(_) => "map",
            Error::ProgramNotFound { .. } => "program_not_found",
            Error::StoreError(_) => "store",
            Error::DockerApi(_) => "docker_api",
            Error::HttpError(_) | Error::HyperError(_) | Error::HttpClientError(_) => "http",
            Error::JsonConversion(_) => "json",
            Error::EventStreamClosed => "event_stream_closed",
            Error::Errno(_) => "errno",
            Error::Task(_) => "task",
            Error::Other(_) => "other",
        };
        label.into()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<aya::EbpfError> for Error {
    fn from(err: EbpfError) -> Self {
        Self::EbpfError(err.to_string())
    }
}

impl From<aya::programs::ProgramError> for Error {
    fn from(err: ProgramError) -> Self {
        Self::EbpfProgramError(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_http_error_converts_and_labels() {
        let err = ::http::Request::builder()
            .header("bad\nname", "x")
            .body(())
            .unwrap_err();
        let err = Error::from(err);
        assert!(matches!(err, Error::HttpError(_)));
        assert_eq!(err.metric_label(), "http");
    }

    #[test]
    fn test_event_stream_closed_label() {
        assert_eq!(Error::EventStreamClosed.metric_label(), "event_stream_closed");
    }
}
