use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("envelope body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("malformed envelope: missing or invalid field '{0}'")]
    MalformedEnvelope(&'static str),

    #[error("unsupported envelope specversion: {0}")]
    UnsupportedSpecVersion(String),
}
