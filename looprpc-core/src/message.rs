use std::fmt;
use std::sync::{Arc, Mutex};

use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage, Value};

use crate::status::RpcError;

/// Script-visible handle over a protobuf message.
///
/// The handle is shared and interior-mutable so the script side can pass the
/// same message through a call, an interceptor, and a handler without
/// copying. Mutation is expected only on the loop thread; the transport side
/// only ever extracts an owned [`DynamicMessage`] snapshot.
#[derive(Clone)]
pub struct MessageValue {
    inner: Arc<Mutex<DynamicMessage>>,
}

impl MessageValue {
    /// An empty message of the given descriptor type.
    pub fn new(descriptor: MessageDescriptor) -> MessageValue {
        MessageValue::from_dynamic(DynamicMessage::new(descriptor))
    }

    pub fn from_dynamic(message: DynamicMessage) -> MessageValue {
        MessageValue {
            inner: Arc::new(Mutex::new(message)),
        }
    }

    pub fn descriptor(&self) -> MessageDescriptor {
        self.lock().descriptor().clone()
    }

    pub fn full_name(&self) -> String {
        self.lock().descriptor().full_name().to_string()
    }

    /// Current value of a field, or `None` for an unknown field name.
    pub fn get(&self, field: &str) -> Option<Value> {
        let msg = self.lock();
        let fd = msg.descriptor().get_field_by_name(field)?;
        Some(msg.get_field(&fd).into_owned())
    }

    /// Convenience accessor for string fields; `None` when the field is
    /// unknown or not a string.
    pub fn get_string(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn set(&self, field: &str, value: Value) -> Result<(), RpcError> {
        let mut msg = self.lock();
        let fd = msg.descriptor().get_field_by_name(field).ok_or_else(|| {
            RpcError::invalid_argument(format!(
                "no field {field:?} on message {}",
                msg.descriptor().full_name()
            ))
        })?;
        msg.set_field(&fd, value);
        Ok(())
    }

    pub fn has(&self, field: &str) -> bool {
        let msg = self.lock();
        match msg.descriptor().get_field_by_name(field) {
            Some(fd) => msg.has_field(&fd),
            None => false,
        }
    }

    /// Serialize to protobuf wire format.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.lock().encode_to_vec()
    }

    /// Replace the contents by parsing wire-format bytes.
    pub fn merge_from_bytes(&self, bytes: &[u8]) -> Result<(), RpcError> {
        let mut msg = self.lock();
        let parsed = DynamicMessage::decode(msg.descriptor().clone(), bytes)
            .map_err(|e| RpcError::internal(format!("message parse: {e}")))?;
        *msg = parsed;
        Ok(())
    }

    /// Owned snapshot of the underlying dynamic message.
    pub fn to_dynamic(&self) -> DynamicMessage {
        self.lock().clone()
    }

    /// Convert to a message of the target descriptor type.
    ///
    /// Fast path: the wrapped message already has the target descriptor and
    /// is returned as a clone. Slow path: the message came from a different
    /// pool (or a sibling type), so it is serialized and re-parsed under the
    /// target descriptor. Parse failures surface as `Internal` conversion
    /// errors, which is also where proto3 validation problems land.
    pub fn to_message(&self, target: &MessageDescriptor) -> Result<DynamicMessage, RpcError> {
        let msg = self.lock();
        if msg.descriptor() == *target {
            return Ok(msg.clone());
        }
        if msg.descriptor().full_name() != target.full_name() {
            return Err(RpcError::internal(format!(
                "request/response conversion: have {}, want {}",
                msg.descriptor().full_name(),
                target.full_name()
            )));
        }
        let bytes = msg.encode_to_vec();
        DynamicMessage::decode(target.clone(), bytes.as_slice())
            .map_err(|e| RpcError::internal(format!("request/response conversion: {e}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DynamicMessage> {
        // Lock poisoning would mean a panic on the loop thread mid-mutation;
        // the message contents are still structurally valid protobuf.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PartialEq for MessageValue {
    fn eq(&self, other: &MessageValue) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        *self.lock() == *other.lock()
    }
}

impl fmt::Debug for MessageValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.lock();
        write!(f, "MessageValue({})", msg.descriptor().full_name())
    }
}
