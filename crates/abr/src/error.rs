use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("HTTP error: {0}")]
    HttpError(u16),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Invalid MPD: {0}")]
    MpdParsing(String),

    #[error("Invalid MP4 data: {0}")]
    Mp4Parsing(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Decryption key required")]
    DecryptionKeyRequired,

    #[error("Stream handler is busy")]
    HandlerBusy,

    #[error("Request was canceled")]
    Canceled,

    #[error("Period not found: {0}")]
    PeriodNotFound(String),

    #[error("No manifest has been loaded")]
    NoManifest,

    #[error("Manifest load failed: {0}")]
    ManifestLoadFailed(String),

    #[error("Invalid timing schema: {0:?}")]
    InvalidTimingSchema(String),

    #[error("Invalid date time: {0}")]
    DateTimeParsing(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    ChronoParseError(#[from] chrono::ParseError),
}

pub type PlayerResult<T> = Result<T, PlayerError>;
