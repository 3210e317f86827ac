use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::wire::messages::{
    PingRequestMessage, RegisterMessage, ResultMessage, TaskAssignment, TaskResult,
    PING_REQUEST_MESSAGE_TYPE, REGISTER_MESSAGE_TYPE, RESULT_MESSAGE_TYPE,
};

// One UTF-8 JSON object per socket write; each successful read is treated
// as one complete frame. This is the interop baseline inherited from the
// protocol: no delimiter, no reassembly, messages must fit the buffer.
pub const READ_BUFFER_SIZE: usize = 4096;
pub const MAX_FRAME_SIZE_BYTES: usize = 4096;

#[derive(Debug)]
pub enum CodecError {
    EmptyFrame,
    FrameTooLarge { size: usize, limit: usize },
    Json(serde_json::Error),
    FrameMustBeObject,
    UnrecognizedFrame { message_type: Option<String> },
    LegacyResultWithoutTaskId,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyFrame => write!(f, "frame is empty"),
            Self::FrameTooLarge { size, limit } => {
                write!(f, "frame size {size} exceeds limit {limit}")
            }
            Self::Json(source) => write!(f, "frame JSON error: {source}"),
            Self::FrameMustBeObject => write!(f, "frame must be a JSON object"),
            Self::UnrecognizedFrame { message_type } => match message_type {
                Some(message_type) => {
                    write!(f, "unrecognized frame with Type '{message_type}'")
                }
                None => write!(f, "unrecognized frame without Type discriminator"),
            },
            Self::LegacyResultWithoutTaskId => {
                write!(f, "legacy result frame carries an empty TaskId")
            }
        }
    }
}

impl std::error::Error for CodecError {}

// Everything a worker may legitimately send. Legacy variants come from
// workers that never adopted the typed envelope.
#[derive(Debug)]
pub enum InboundMessage {
    Result(TaskResult),
    Ping(PingRequestMessage),
    Register(RegisterMessage),
    LegacyResult(TaskResult),
    LegacyTask(TaskAssignment),
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let encoded = serde_json::to_vec(message).map_err(CodecError::Json)?;
    if encoded.len() > MAX_FRAME_SIZE_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: encoded.len(),
            limit: MAX_FRAME_SIZE_BYTES,
        });
    }
    Ok(encoded)
}

pub fn classify_frame(frame: &[u8]) -> Result<InboundMessage, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    if frame.len() > MAX_FRAME_SIZE_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            limit: MAX_FRAME_SIZE_BYTES,
        });
    }

    let value: Value = serde_json::from_slice(frame).map_err(CodecError::Json)?;
    if !value.is_object() {
        return Err(CodecError::FrameMustBeObject);
    }

    let message_type = value
        .get("Type")
        .and_then(Value::as_str)
        .map(str::to_owned);

    match message_type.as_deref() {
        Some(RESULT_MESSAGE_TYPE) => {
            let message: ResultMessage =
                serde_json::from_value(value).map_err(CodecError::Json)?;
            Ok(InboundMessage::Result(message.result))
        }
        Some(PING_REQUEST_MESSAGE_TYPE) => {
            let message: PingRequestMessage =
                serde_json::from_value(value).map_err(CodecError::Json)?;
            Ok(InboundMessage::Ping(message))
        }
        Some(REGISTER_MESSAGE_TYPE) => {
            let message: RegisterMessage =
                serde_json::from_value(value).map_err(CodecError::Json)?;
            Ok(InboundMessage::Register(message))
        }
        _ => classify_legacy_frame(value, message_type),
    }
}

// Second parse attempt for untyped frames: a bare Result (non-empty TaskId)
// or a bare Task body is still accepted.
fn classify_legacy_frame(
    value: Value,
    message_type: Option<String>,
) -> Result<InboundMessage, CodecError> {
    if let Ok(result) = serde_json::from_value::<TaskResult>(value.clone()) {
        if result.task_id.is_empty() {
            return Err(CodecError::LegacyResultWithoutTaskId);
        }
        return Ok(InboundMessage::LegacyResult(result));
    }

    if let Ok(task) = serde_json::from_value::<TaskAssignment>(value) {
        if !task.task_id.is_empty() {
            return Ok(InboundMessage::LegacyTask(task));
        }
    }

    Err(CodecError::UnrecognizedFrame { message_type })
}
