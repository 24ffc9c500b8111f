use thiserror::Error;

/// Wire-level encode/decode failures.
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("truncated input: expected {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unknown field tag {tag} in {record}")]
    UnknownFieldTag { record: &'static str, tag: u8 },

    #[error("missing required field {field} in {record}")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },

    #[error("invalid utf-8 in field {field}")]
    InvalidUtf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("corrupt payload: {0}")]
    Corruption(String),
}
