use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("invalid utf-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unknown value type tag {0}")]
    UnknownValueType(i32),
    #[error("unknown opcode {0}")]
    UnknownOpcode(i32),
    #[error("unknown status {0}")]
    UnknownStatus(i32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
