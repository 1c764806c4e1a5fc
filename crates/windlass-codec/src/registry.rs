//! Process-wide registry of serializable user classes.
//!
//! Populated once at startup (the build pipeline emits a registration call
//! per tagged class); reads afterwards are lock-free in practice since the
//! map never changes again. Deserialization fails loudly on an unregistered
//! class id — silently falling back to structural data would strand later
//! readers with state they cannot rebuild behavior from.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use windlass_core::ClassName;

use crate::error::CodecError;
use crate::value::Value;

/// A type that can cross boundaries as a registered class instance.
///
/// `serialize`/`deserialize` must be pure: the data they exchange is
/// persisted in the event log and replayed on cold starts.
pub trait DurableClass: Sized + Send + Sync + 'static {
    /// Stable class id (`class//<module>//<ClassName>`), assigned by the
    /// build pipeline.
    fn class_id() -> ClassName;

    /// Reduce an instance to plain value data.
    fn serialize(&self) -> Result<Value, CodecError>;

    /// Rebuild an instance from value data.
    fn deserialize(data: Value) -> Result<Self, CodecError>;
}

struct ClassEntry {
    type_name: &'static str,
}

static REGISTRY: Lazy<RwLock<HashMap<String, ClassEntry>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a class. Idempotent for the same type; re-registering a class id
/// under a different Rust type replaces the entry (last registration wins, as
/// with module re-evaluation).
pub fn register_class<T: DurableClass>() {
    REGISTRY.write().insert(
        T::class_id().to_string(),
        ClassEntry {
            type_name: std::any::type_name::<T>(),
        },
    );
}

/// Whether a class id has a registration.
#[must_use]
pub fn is_registered(class_id: &ClassName) -> bool {
    REGISTRY.read().contains_key(&class_id.to_string())
}

/// The Rust type name registered for a class id, for diagnostics.
#[must_use]
pub fn registered_type_name(class_id: &ClassName) -> Option<&'static str> {
    REGISTRY.read().get(&class_id.to_string()).map(|e| e.type_name)
}

impl Value {
    /// Encodes a registered class instance as a value.
    pub fn from_instance<T: DurableClass>(instance: &T) -> Result<Value, CodecError> {
        let class_id = T::class_id();
        if !is_registered(&class_id) {
            return Err(CodecError::UnregisteredClass {
                class_id: class_id.to_string(),
            });
        }
        let data = instance.serialize().map_err(|e| CodecError::ClassCodec {
            class_id: class_id.to_string(),
            direction: "serialize",
            reason: e.to_string(),
        })?;
        Ok(Value::Instance {
            class_id,
            data: Box::new(data),
        })
    }

    /// Decodes a class-instance value back into its registered type.
    pub fn to_instance<T: DurableClass>(&self) -> Result<T, CodecError> {
        let expected = T::class_id();
        match self {
            Value::Instance { class_id, data } if *class_id == expected => {
                T::deserialize((**data).clone()).map_err(|e| CodecError::ClassCodec {
                    class_id: class_id.to_string(),
                    direction: "deserialize",
                    reason: e.to_string(),
                })
            }
            Value::Instance { class_id, .. } => Err(CodecError::ClassCodec {
                class_id: class_id.to_string(),
                direction: "deserialize",
                reason: format!("expected an instance of {expected}"),
            }),
            Value::Shared(cell) => cell.get().to_instance::<T>(),
            _ => Err(CodecError::ClassCodec {
                class_id: expected.to_string(),
                direction: "deserialize",
                reason: "value is not a class instance".to_string(),
            }),
        }
    }
}
