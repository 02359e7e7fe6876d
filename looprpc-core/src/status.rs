use std::fmt;

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage};

use crate::message::MessageValue;

/// gRPC status codes as script-visible integer constants.
pub mod code {
    pub const OK: i32 = 0;
    pub const CANCELLED: i32 = 1;
    pub const UNKNOWN: i32 = 2;
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const NOT_FOUND: i32 = 5;
    pub const ALREADY_EXISTS: i32 = 6;
    pub const PERMISSION_DENIED: i32 = 7;
    pub const RESOURCE_EXHAUSTED: i32 = 8;
    pub const FAILED_PRECONDITION: i32 = 9;
    pub const ABORTED: i32 = 10;
    pub const OUT_OF_RANGE: i32 = 11;
    pub const UNIMPLEMENTED: i32 = 12;
    pub const INTERNAL: i32 = 13;
    pub const UNAVAILABLE: i32 = 14;
    pub const DATA_LOSS: i32 = 15;
    pub const UNAUTHENTICATED: i32 = 16;

    /// Canonical name for a code, `"Unknown"` for out-of-range values.
    pub fn name(code: i32) -> &'static str {
        match code {
            OK => "OK",
            CANCELLED => "Cancelled",
            UNKNOWN => "Unknown",
            INVALID_ARGUMENT => "InvalidArgument",
            DEADLINE_EXCEEDED => "DeadlineExceeded",
            NOT_FOUND => "NotFound",
            ALREADY_EXISTS => "AlreadyExists",
            PERMISSION_DENIED => "PermissionDenied",
            RESOURCE_EXHAUSTED => "ResourceExhausted",
            FAILED_PRECONDITION => "FailedPrecondition",
            ABORTED => "Aborted",
            OUT_OF_RANGE => "OutOfRange",
            UNIMPLEMENTED => "Unimplemented",
            INTERNAL => "Internal",
            UNAVAILABLE => "Unavailable",
            DATA_LOSS => "DataLoss",
            UNAUTHENTICATED => "Unauthenticated",
            _ => "Unknown",
        }
    }
}

/// Convert an integer code to a tonic code, `Unknown` for out-of-range.
pub fn tonic_code(code: i32) -> tonic::Code {
    match code {
        0 => tonic::Code::Ok,
        1 => tonic::Code::Cancelled,
        2 => tonic::Code::Unknown,
        3 => tonic::Code::InvalidArgument,
        4 => tonic::Code::DeadlineExceeded,
        5 => tonic::Code::NotFound,
        6 => tonic::Code::AlreadyExists,
        7 => tonic::Code::PermissionDenied,
        8 => tonic::Code::ResourceExhausted,
        9 => tonic::Code::FailedPrecondition,
        10 => tonic::Code::Aborted,
        11 => tonic::Code::OutOfRange,
        12 => tonic::Code::Unimplemented,
        13 => tonic::Code::Internal,
        14 => tonic::Code::Unavailable,
        15 => tonic::Code::DataLoss,
        16 => tonic::Code::Unauthenticated,
        _ => tonic::Code::Unknown,
    }
}

fn code_from_tonic(code: tonic::Code) -> i32 {
    match code {
        tonic::Code::Ok => code::OK,
        tonic::Code::Cancelled => code::CANCELLED,
        tonic::Code::Unknown => code::UNKNOWN,
        tonic::Code::InvalidArgument => code::INVALID_ARGUMENT,
        tonic::Code::DeadlineExceeded => code::DEADLINE_EXCEEDED,
        tonic::Code::NotFound => code::NOT_FOUND,
        tonic::Code::AlreadyExists => code::ALREADY_EXISTS,
        tonic::Code::PermissionDenied => code::PERMISSION_DENIED,
        tonic::Code::ResourceExhausted => code::RESOURCE_EXHAUSTED,
        tonic::Code::FailedPrecondition => code::FAILED_PRECONDITION,
        tonic::Code::Aborted => code::ABORTED,
        tonic::Code::OutOfRange => code::OUT_OF_RANGE,
        tonic::Code::Unimplemented => code::UNIMPLEMENTED,
        tonic::Code::Internal => code::INTERNAL,
        tonic::Code::Unavailable => code::UNAVAILABLE,
        tonic::Code::DataLoss => code::DATA_LOSS,
        tonic::Code::Unauthenticated => code::UNAUTHENTICATED,
    }
}

/// `google.rpc.Status`, the wire form carried in `grpc-status-details-bin`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusProto {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

/// The type-URL prefix gRPC uses for `Any`-packed status details.
const ANY_TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// The script-visible status error.
///
/// `details` is what scripts inspect; `wire_details` is the hidden slot that
/// carries the `Any`-packed forms losslessly when a received error is thrown
/// back from a server handler. `wire_details` is always a subset of
/// `details`: elements that cannot be packed stay script-visible only.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    pub details: Vec<MessageValue>,
    pub(crate) wire_details: Vec<prost_types::Any>,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> RpcError {
        RpcError {
            code,
            message: message.into(),
            details: Vec::new(),
            wire_details: Vec::new(),
        }
    }

    /// Build an error carrying detail messages.
    ///
    /// Every element lands in `details`; elements that pack into `Any`
    /// successfully additionally land in `wire_details`.
    pub fn with_details(
        code: i32,
        message: impl Into<String>,
        details: impl IntoIterator<Item = MessageValue>,
    ) -> RpcError {
        let mut err = RpcError::new(code, message);
        for detail in details {
            if let Some(any) = pack_any(&detail) {
                err.wire_details.push(any);
            }
            err.details.push(detail);
        }
        err
    }

    pub fn cancelled(message: impl Into<String>) -> RpcError {
        RpcError::new(code::CANCELLED, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> RpcError {
        RpcError::new(code::INVALID_ARGUMENT, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> RpcError {
        RpcError::new(code::DEADLINE_EXCEEDED, message)
    }

    pub fn not_found(message: impl Into<String>) -> RpcError {
        RpcError::new(code::NOT_FOUND, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> RpcError {
        RpcError::new(code::UNIMPLEMENTED, message)
    }

    pub fn internal(message: impl Into<String>) -> RpcError {
        RpcError::new(code::INTERNAL, message)
    }

    pub fn unavailable(message: impl Into<String>) -> RpcError {
        RpcError::new(code::UNAVAILABLE, message)
    }

    /// The rejection used when a loop submit fails after shutdown.
    pub fn loop_closed() -> RpcError {
        RpcError::unavailable("event loop not running")
    }

    pub fn code_name(&self) -> &'static str {
        code::name(self.code)
    }

    /// Rebuild the wire-level status: code, message, and the packed detail
    /// list encoded as `google.rpc.Status` in the details payload.
    pub fn to_status(&self) -> tonic::Status {
        if self.wire_details.is_empty() {
            return tonic::Status::new(tonic_code(self.code), self.message.clone());
        }
        let proto = StatusProto {
            code: self.code,
            message: self.message.clone(),
            details: self.wire_details.clone(),
        };
        tonic::Status::with_details(
            tonic_code(self.code),
            self.message.clone(),
            prost::bytes::Bytes::from(proto.encode_to_vec()),
        )
    }

    /// Rebuild the script error from a wire status.
    ///
    /// Detail decoding is best-effort: every `Any` is kept in `wire_details`,
    /// and the ones whose type URL resolves in `pool` are also decoded into
    /// `details`. Unknown or undecodable detail types are skipped from the
    /// script-visible list.
    pub fn from_status(status: &tonic::Status, pool: Option<&DescriptorPool>) -> RpcError {
        let mut err = RpcError::new(code_from_tonic(status.code()), status.message());
        let raw = status.details();
        if raw.is_empty() {
            return err;
        }
        let Ok(proto) = StatusProto::decode(raw) else {
            return err;
        };
        for any in proto.details {
            if let Some(pool) = pool {
                if let Some(detail) = unpack_any(&any, pool) {
                    err.details.push(detail);
                    err.wire_details.push(any);
                    continue;
                }
            }
            err.wire_details.push(any);
        }
        err
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GrpcError {}: {}", self.code_name(), self.message)
    }
}

impl PartialEq for RpcError {
    fn eq(&self, other: &RpcError) -> bool {
        self.code == other.code
            && self.message == other.message
            && self.details == other.details
            && self.wire_details == other.wire_details
    }
}

impl std::error::Error for RpcError {}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> RpcError {
        RpcError::from_status(&status, None)
    }
}

/// Pack a message wrapper into `google.protobuf.Any`. `None` when the
/// wrapped message cannot be serialized under its own descriptor.
pub(crate) fn pack_any(detail: &MessageValue) -> Option<prost_types::Any> {
    let full_name = detail.full_name();
    if full_name.is_empty() {
        return None;
    }
    Some(prost_types::Any {
        type_url: format!("{ANY_TYPE_URL_PREFIX}{full_name}"),
        value: detail.encode_to_vec(),
    })
}

/// Resolve and decode an `Any` against the pool. `None` for unknown type
/// URLs or undecodable payloads.
pub(crate) fn unpack_any(any: &prost_types::Any, pool: &DescriptorPool) -> Option<MessageValue> {
    let full_name = any.type_url.rsplit('/').next()?;
    let desc = pool.get_message_by_name(full_name)?;
    let msg = DynamicMessage::decode(desc, any.value.as_slice()).ok()?;
    Some(MessageValue::from_dynamic(msg))
}
