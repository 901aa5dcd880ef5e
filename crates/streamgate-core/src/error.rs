use std::path::PathBuf;

/// The closed set of failure kinds a sub-component can report. The coordinator is the only
/// party that decides which of these are recoverable (see `Error::is_recoverable`).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no suitable video file in torrent")]
    NoMedia,

    #[error("torrent appears to be dead (no peers found)")]
    DeadTorrent,

    #[error("torrent engine error: {0:#}")]
    EngineError(#[source] anyhow::Error),

    #[error("input file not ready: {0}")]
    FileNotReady(String),

    #[error("packager codec error: {0}")]
    CodecError(String),

    #[error("packager failed: {0}")]
    PackagerFatal(String),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("stream not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The short machine-readable kind, matching the vocabulary in the error handling design:
/// `invalid_input`, `no_media`, `dead_torrent`, `engine_error`, `file_not_ready`, `codec_error`,
/// `io_error`, `cancelled`.
impl Error {
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NoMedia => "no_media",
            Error::DeadTorrent => "dead_torrent",
            Error::EngineError(_) => "engine_error",
            Error::FileNotReady(_) => "file_not_ready",
            Error::CodecError(_) => "codec_error",
            Error::PackagerFatal(_) => "fatal",
            Error::Io { .. } => "io_error",
            Error::Cancelled => "cancelled",
            Error::NotFound => "not_found",
        }
    }

    /// Whether the coordinator should retry rather than transition the stream to `error`.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::FileNotReady(_) | Error::CodecError(_))
    }
}
