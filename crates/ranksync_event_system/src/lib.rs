//! # RankSync Event System
//!
//! A small, type-safe publish/subscribe bus that carries the domain events of the
//! RankSync synchronization core: link codes being created and redeemed, players
//! coming online, ranks changing and bots starting or being forced down.
//!
//! ## Design
//!
//! - **Type Safety**: handlers are registered for a concrete event type and only
//!   ever see that type.
//! - **Serialized Payloads**: every event is serialized once per emission and
//!   deserialized per handler, so handlers never share mutable state with the
//!   publisher.
//! - **Ordered Delivery**: handlers for one event run one after another, in
//!   registration order, each to completion.
//! - **Short Critical Section**: the subscriber list is locked only while the
//!   handler list is copied out. Handlers run without the lock held, so a handler
//!   may publish, subscribe or unsubscribe without deadlocking and a slow handler
//!   never blocks unrelated publishers.
//!
//! ## Quick Start
//!
//! ```rust
//! use ranksync_event_system::*;
//!
//! # async fn demo() -> Result<(), EventError> {
//! let events = create_event_system();
//!
//! events.subscribe(|event: BotEnabledEvent| {
//!     println!("bot {} is ready", event.bot_name);
//!     Ok(())
//! }).await?;
//!
//! events.publish(&BotEnabledEvent {
//!     bot_name: "discord".to_string(),
//!     timestamp: current_timestamp(),
//! }).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::any::{Any, TypeId};
use std::sync::Arc;

pub mod events;
pub mod system;
pub mod types;

pub use events::*;
pub use system::{EventSystem, SubscriptionId};
pub use types::{ExternalId, GameId, Identity};

// ============================================================================
// Event traits
// ============================================================================

/// Core trait for everything that can travel over the event system.
///
/// Most types get this through the blanket implementation below; deriving
/// `Serialize`, `Deserialize` and `Debug` is enough.
pub trait Event: Send + Sync + Any + std::fmt::Debug {
    /// Returns the type name of this event for debugging and routing.
    fn type_name() -> &'static str
    where
        Self: Sized;

    /// Serializes the event to bytes.
    fn serialize(&self) -> Result<Vec<u8>, EventError>;

    /// Deserializes an event from bytes.
    fn deserialize(data: &[u8]) -> Result<Self, EventError>
    where
        Self: Sized;

    /// Returns a reference to this event as `&dyn Any` for dynamic typing.
    fn as_any(&self) -> &dyn Any;
}

impl<T> Event for T
where
    T: Serialize + DeserializeOwned + Send + Sync + Any + std::fmt::Debug + 'static,
{
    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn serialize(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(EventError::Serialization)
    }

    fn deserialize(data: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(data).map_err(EventError::Deserialization)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Handler trait the event system calls for every matching emission.
///
/// Users rarely implement this directly; [`TypedEventHandler`] adapts a plain
/// closure.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles an event from serialized data.
    async fn handle(&self, data: &[u8]) -> Result<(), EventError>;

    /// Returns the TypeId of the event type this handler expects.
    fn expected_type_id(&self) -> TypeId;

    /// Returns a human-readable name for this handler for debugging.
    fn handler_name(&self) -> &str;
}

/// Type-safe wrapper bridging a closure over `T` to [`EventHandler`].
pub struct TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    handler: F,
    name: String,
    _phantom: std::marker::PhantomData<T>,
}

impl<T, F> TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    pub fn new(name: String, handler: F) -> Self {
        Self {
            handler,
            name,
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> EventHandler for TypedEventHandler<T, F>
where
    T: Event,
    F: Fn(T) -> Result<(), EventError> + Send + Sync,
{
    async fn handle(&self, data: &[u8]) -> Result<(), EventError> {
        let event = T::deserialize(data)?;
        (self.handler)(event)
    }

    fn expected_type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Statistics and errors
// ============================================================================

/// Counters describing the event system since creation.
#[derive(Debug, Default, Clone)]
pub struct EventSystemStats {
    /// Number of currently registered handlers
    pub total_handlers: usize,
    /// Number of emissions that reached at least one handler
    pub events_emitted: u64,
    /// Number of handler invocations that returned an error
    pub handler_failures: u64,
}

/// Errors that can occur during event system operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// Serialization failed when converting event to bytes
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Deserialization failed when converting bytes to event
    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
    /// No handler found for the specified event type
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),
    /// Handler execution failed during event processing
    #[error("Handler execution error: {0}")]
    HandlerExecution(String),
}

// ============================================================================
// Utilities
// ============================================================================

/// Current time as milliseconds since the Unix epoch.
///
/// Falls back to 0 if the system clock reports a time before the epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Creates a new, empty event system ready to be shared.
pub fn create_event_system() -> Arc<EventSystem> {
    Arc::new(EventSystem::new())
}
