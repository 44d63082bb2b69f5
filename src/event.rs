//! Domain events, type-erased envelopes, and routing key derivation.
//!
//! A domain event is any serde-serializable type implementing [`DomainEvent`].
//! Buses never see the concrete type: events travel as [`EventEnvelope`]s,
//! which carry the event type name, a shared payload, and an encoder that
//! knows how to serialize that payload.
//!
//! ## Routing keys
//!
//! Routing keys are derived from the event type name by splitting on
//! capitalization boundaries:
//!
//! ```text
//! UsuarioAtivado   -> usuario.ativado
//! GameComprado     -> game.comprado
//! Order            -> order
//! ```
//!
//! Two distinct event types in one deployment must not derive the same key.
//! This is an assumption about event naming, not something checked at runtime;
//! use [`RoutingTable::with_override`] when two names would collide.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A named, immutable fact published on an event bus.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name used for handler lookup, routing, and headers.
    ///
    /// Defaults to the unqualified Rust type name. Override when the wire name
    /// must differ from the Rust name (renames, generic wrappers).
    fn event_type() -> &'static str
    where
        Self: Sized,
    {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Strip the module path from a fully-qualified type name.
///
/// Generic arguments are left in place, so `a::Wrapper<b::Inner>` becomes
/// `Wrapper<b::Inner>`.
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}

/// Derive a broker routing key from an event type name.
///
/// Each word is one ASCII uppercase letter followed by any run of ASCII
/// lowercase letters. Words are lower-cased and joined with `.`; anything not
/// part of a word is dropped.
pub fn derive_routing_key(event_type: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for c in event_type.chars() {
        if c.is_ascii_uppercase() {
            if let Some(word) = current.take() {
                words.push(word);
            }
            current = Some(c.to_ascii_lowercase().to_string());
        } else if c.is_ascii_lowercase() {
            if let Some(word) = current.as_mut() {
                word.push(c);
            }
        } else if let Some(word) = current.take() {
            words.push(word);
        }
    }
    if let Some(word) = current {
        words.push(word);
    }

    words.join(".")
}

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> serde_json::Result<Vec<u8>>;

fn encode_json<E: DomainEvent>(payload: &(dyn Any + Send + Sync)) -> serde_json::Result<Vec<u8>> {
    match payload.downcast_ref::<E>() {
        Some(event) => serde_json::to_vec(event),
        // The envelope pairs each payload with its own encoder, so a mismatch
        // cannot be constructed outside this module.
        None => Err(serde::ser::Error::custom(format!(
            "payload is not a {}",
            E::event_type()
        ))),
    }
}

/// Type-erased domain event as carried by every bus.
///
/// Cloning is cheap: the payload is shared behind an `Arc`.
#[derive(Clone)]
pub struct EventEnvelope {
    event_type: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
    encode: EncodeFn,
}

impl EventEnvelope {
    /// Wrap a domain event.
    pub fn new<E: DomainEvent>(event: E) -> Self {
        Self::from_arc(Arc::new(event))
    }

    /// Wrap an already shared domain event without copying it.
    pub fn from_arc<E: DomainEvent>(event: Arc<E>) -> Self {
        Self {
            event_type: E::event_type(),
            payload: event,
            encode: encode_json::<E>,
        }
    }

    /// Event type name.
    pub fn event_type(&self) -> &'static str {
        self.event_type
    }

    /// Recover the concrete event, if this envelope carries an `E`.
    pub fn downcast<E: DomainEvent>(&self) -> Option<Arc<E>> {
        Arc::clone(&self.payload).downcast::<E>().ok()
    }

    /// Check whether this envelope carries an `E`.
    pub fn is<E: DomainEvent>(&self) -> bool {
        self.payload.is::<E>()
    }

    /// Serialize the payload as JSON.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        (self.encode)(self.payload.as_ref())
    }

    /// Reject envelopes that cannot be dispatched.
    pub fn validate(&self) -> crate::bus::Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(crate::bus::BusError::InvalidArgument(
                "event type name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Resolves routing keys per event type.
///
/// Explicit overrides win; everything else is derived with
/// [`derive_routing_key`] once and cached.
#[derive(Debug, Default)]
pub struct RoutingTable {
    overrides: HashMap<String, String>,
    derived: RwLock<HashMap<&'static str, Arc<str>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configured overrides.
    pub fn from_overrides(overrides: HashMap<String, String>) -> Self {
        Self {
            overrides,
            derived: RwLock::new(HashMap::new()),
        }
    }

    /// Route `event_type` to a fixed key instead of the derived one.
    pub fn with_override(mut self, event_type: impl Into<String>, key: impl Into<String>) -> Self {
        self.overrides.insert(event_type.into(), key.into());
        self
    }

    /// Routing key for an event type.
    pub fn routing_key(&self, event_type: &'static str) -> Arc<str> {
        if let Some(key) = self.overrides.get(event_type) {
            return Arc::from(key.as_str());
        }

        if let Ok(cache) = self.derived.read() {
            if let Some(key) = cache.get(event_type) {
                return Arc::clone(key);
            }
        }

        let key: Arc<str> = Arc::from(derive_routing_key(event_type));
        if let Ok(mut cache) = self.derived.write() {
            cache.insert(event_type, Arc::clone(&key));
        }
        key
    }

    /// Routing key for a typed event.
    pub fn routing_key_for<E: DomainEvent>(&self) -> Arc<str> {
        self.routing_key(E::event_type())
    }
}
