//! Marshal strategies and the strategy registry
//!
//! A marshal strategy turns a [`serde_json::Value`] into a wire [`Payload`] and
//! back. Strategies are looked up by name from a [`MarshalRegistry`] that is
//! shared between publishers and workers; the envelope's `x-marshal` header
//! names the strategy a message was encoded with.
//!
//! ## Built-in strategies
//!
//! | Name | Kind | Notes |
//! |------|------|-------|
//! | `native` | bytes | default when no name is given |
//! | `json` | text | JSON text |
//! | `string` | text | strings pass through, other values use their JSON text |
//!
//! ## Example
//!
//! ```rust,ignore
//! use queue_worker::{MarshalRegistry, StrategyBuilder, PayloadKind, Payload};
//!
//! let registry = MarshalRegistry::new();
//! let upper = StrategyBuilder::new("upper")
//!     .kind(PayloadKind::Text)
//!     .marshal(|v| Ok(Payload::Text(v.to_string().to_uppercase())))
//!     .unmarshal(|p| Ok(serde_json::Value::String(p.as_text_lossy())))
//!     .build()?;
//! registry.register("upper", std::sync::Arc::new(upper))?;
//! ```

use crate::error::MarshalError;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, info};

/// Name of the strategy used when a message does not declare one
pub const DEFAULT_STRATEGY: &str = "native";

/// Wire representation produced by a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum PayloadKind {
    Text,
    Bytes,
}

/// Encoded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Text(_) => PayloadKind::Text,
            Payload::Bytes(_) => PayloadKind::Bytes,
        }
    }

    /// Raw bytes of the payload, whatever its kind
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Bytes(bytes) => bytes,
        }
    }

    /// Text view of the payload; invalid UTF-8 in byte payloads is replaced
    pub fn as_text_lossy(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Rebuild a payload from its kind and raw bytes
    pub fn from_parts(
        kind: PayloadKind,
        bytes: Vec<u8>,
    ) -> Result<Self, std::string::FromUtf8Error> {
        match kind {
            PayloadKind::Text => String::from_utf8(bytes).map(Payload::Text),
            PayloadKind::Bytes => Ok(Payload::Bytes(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named codec between the object model and wire payloads
pub trait MarshalStrategy: Send + Sync {
    /// Kind of payload produced by [`MarshalStrategy::marshal`]
    fn kind(&self) -> PayloadKind;

    fn marshal(&self, value: &Value) -> Result<Payload, MarshalError>;

    fn unmarshal(&self, payload: &Payload) -> Result<Value, MarshalError>;
}

/// Serialize a typed object and encode it with `strategy`
///
/// Fails when the strategy produces a payload of another kind than it declares.
pub fn marshal_object<T: Serialize + ?Sized>(
    strategy: &dyn MarshalStrategy,
    object: &T,
) -> Result<Payload, MarshalError> {
    let value = serde_json::to_value(object).map_err(|e| MarshalError::encode("serde", e))?;
    let payload = strategy.marshal(&value)?;

    if payload.kind() != strategy.kind() {
        return Err(MarshalError::encode(
            format!("{} strategy", strategy.kind()),
            format!("produced a {} payload", payload.kind()),
        ));
    }
    Ok(payload)
}

/// Decode `payload` with `strategy` and deserialize it into `T`
pub fn unmarshal_object<T: DeserializeOwned>(
    strategy: &dyn MarshalStrategy,
    payload: &Payload,
) -> Result<T, MarshalError> {
    let value = strategy.unmarshal(payload)?;
    serde_json::from_value(value).map_err(|e| MarshalError::decode("serde", e))
}

/// Default binary strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeStrategy;

impl MarshalStrategy for NativeStrategy {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Bytes
    }

    fn marshal(&self, value: &Value) -> Result<Payload, MarshalError> {
        serde_json::to_vec(value)
            .map(Payload::Bytes)
            .map_err(|e| MarshalError::encode(DEFAULT_STRATEGY, e))
    }

    fn unmarshal(&self, payload: &Payload) -> Result<Value, MarshalError> {
        serde_json::from_slice(payload.as_bytes())
            .map_err(|e| MarshalError::decode(DEFAULT_STRATEGY, e))
    }
}

/// JSON text strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonStrategy;

impl MarshalStrategy for JsonStrategy {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn marshal(&self, value: &Value) -> Result<Payload, MarshalError> {
        serde_json::to_string(value)
            .map(Payload::Text)
            .map_err(|e| MarshalError::encode("json", e))
    }

    fn unmarshal(&self, payload: &Payload) -> Result<Value, MarshalError> {
        serde_json::from_slice(payload.as_bytes()).map_err(|e| MarshalError::decode("json", e))
    }
}

/// Plain string strategy
///
/// Decoding always yields a string value, so only strings round-trip.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringStrategy;

impl MarshalStrategy for StringStrategy {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Text
    }

    fn marshal(&self, value: &Value) -> Result<Payload, MarshalError> {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(Payload::Text(text))
    }

    fn unmarshal(&self, payload: &Payload) -> Result<Value, MarshalError> {
        match payload {
            Payload::Text(text) => Ok(Value::String(text.clone())),
            Payload::Bytes(bytes) => String::from_utf8(bytes.clone())
                .map(Value::String)
                .map_err(|e| MarshalError::decode("string", e)),
        }
    }
}

type MarshalFn = Box<dyn Fn(&Value) -> Result<Payload, MarshalError> + Send + Sync>;
type UnmarshalFn = Box<dyn Fn(&Payload) -> Result<Value, MarshalError> + Send + Sync>;

/// Strategy assembled from closures by [`StrategyBuilder`]
pub struct FnStrategy {
    kind: PayloadKind,
    marshal: MarshalFn,
    unmarshal: UnmarshalFn,
}

impl MarshalStrategy for FnStrategy {
    fn kind(&self) -> PayloadKind {
        self.kind
    }

    fn marshal(&self, value: &Value) -> Result<Payload, MarshalError> {
        (self.marshal)(value)
    }

    fn unmarshal(&self, payload: &Payload) -> Result<Value, MarshalError> {
        (self.unmarshal)(payload)
    }
}

/// Builder for ad-hoc strategies
///
/// `build` fails unless kind, marshal and unmarshal were all supplied.
pub struct StrategyBuilder {
    name: String,
    kind: Option<PayloadKind>,
    marshal: Option<MarshalFn>,
    unmarshal: Option<UnmarshalFn>,
}

impl StrategyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            marshal: None,
            unmarshal: None,
        }
    }

    pub fn kind(mut self, kind: PayloadKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn marshal<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Payload, MarshalError> + Send + Sync + 'static,
    {
        self.marshal = Some(Box::new(f));
        self
    }

    pub fn unmarshal<F>(mut self, f: F) -> Self
    where
        F: Fn(&Payload) -> Result<Value, MarshalError> + Send + Sync + 'static,
    {
        self.unmarshal = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<FnStrategy, MarshalError> {
        let kind = self
            .kind
            .ok_or_else(|| MarshalError::invalid(&self.name, "missing marshal type"))?;
        let marshal = self
            .marshal
            .ok_or_else(|| MarshalError::invalid(&self.name, "missing marshal"))?;
        let unmarshal = self
            .unmarshal
            .ok_or_else(|| MarshalError::invalid(&self.name, "missing unmarshal"))?;

        Ok(FnStrategy {
            kind,
            marshal,
            unmarshal,
        })
    }
}

/// Registry of named marshal strategies
///
/// Construct one per process, register custom strategies during setup and
/// share it (`Arc<MarshalRegistry>`) with every worker and publisher.
pub struct MarshalRegistry {
    strategies: RwLock<HashMap<String, Arc<dyn MarshalStrategy>>>,
    default: Arc<dyn MarshalStrategy>,
}

impl MarshalRegistry {
    /// Create a registry holding the built-in strategies
    pub fn new() -> Self {
        let mut strategies: HashMap<String, Arc<dyn MarshalStrategy>> = HashMap::new();
        let native: Arc<dyn MarshalStrategy> = Arc::new(NativeStrategy);
        strategies.insert(DEFAULT_STRATEGY.to_string(), native.clone());
        strategies.insert("json".to_string(), Arc::new(JsonStrategy));
        strategies.insert("string".to_string(), Arc::new(StringStrategy));

        Self {
            strategies: RwLock::new(strategies),
            default: native,
        }
    }

    /// Register `strategy` under `name`, replacing any previous entry
    ///
    /// Only the name is checked here. A strategy may accept a narrow set of
    /// values, so encoding failures surface when a message is marshalled.
    pub fn register(
        &self,
        name: impl Into<String>,
        strategy: Arc<dyn MarshalStrategy>,
    ) -> Result<(), MarshalError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MarshalError::invalid(name, "name must not be empty"));
        }

        let replaced = self.write().insert(name.clone(), strategy).is_some();
        info!(strategy = %name, replaced = replaced, "Registered marshal strategy");
        Ok(())
    }

    /// Remove the strategy registered under `name`
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.write().remove(name).is_some();
        debug!(strategy = %name, removed = removed, "Unregistered marshal strategy");
        removed
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up a strategy; `None` returns the default native strategy
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn MarshalStrategy>, MarshalError> {
        match name {
            None => Ok(self.default.clone()),
            Some(name) => self
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| MarshalError::UnknownStrategy(name.to_string())),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn MarshalStrategy>>> {
        self.strategies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn MarshalStrategy>>> {
        self.strategies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MarshalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarshalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarshalRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}
