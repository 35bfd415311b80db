use std::io;
use std::result;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the target address is the address of this node")]
    SelfAddress,

    #[error("the bucket is full")]
    BucketFull,

    #[error("malformed multiaddress: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("the request was cancelled")]
    Cancelled,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;
