use thiserror::Error;

/// Decoding failures for a single SI frame. Per-message: the surrounding
/// loop logs these and keeps going, they never tear down a reader task.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PunchError {
    #[error("frame shorter than a punch record")]
    ShortFrame,
    #[error("frame does not start with 0xFF 0x02")]
    BadStartByte,
    #[error("frame does not end with 0x03")]
    BadTerminator,
    #[error("checksum mismatch")]
    CrcMismatch,
    #[error("unknown record type 0x{0:02x}")]
    UnknownRecord(u8),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Punch(#[from] PunchError),
    #[error("protobuf parse error: {0}")]
    ProtobufParse(#[from] prost::DecodeError),
    #[error("invalid MAC address: {0}")]
    InvalidMacAddress(String),
    #[error("AT command timed out")]
    AtTimeout,
    #[error("modem error: {0}")]
    Modem(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("serial error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
