/// Core EventSystem implementation
use crate::events::SyncEvent;
use crate::{Event, EventError, EventHandler, EventSystemStats, TypedEventHandler};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Handle returned by every registration, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

struct Registration {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// The dispatcher that routes events to their registered handlers.
///
/// Event keys are `namespace:name` strings. Domain events live under `sync:` and
/// are normally used through [`EventSystem::subscribe`] and
/// [`EventSystem::publish`]; the raw [`EventSystem::on`] / [`EventSystem::emit`]
/// pair accepts any key.
///
/// # Thread Safety
///
/// `EventSystem` is meant to be shared as `Arc<EventSystem>`. The handler table
/// sits behind an async read-write lock that is only held while the table is
/// read or modified; emission copies the matching handler list out first and
/// runs the handlers with no lock held.
pub struct EventSystem {
    /// Map of event keys to their registered handlers, in registration order
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    /// System statistics for monitoring
    stats: RwLock<EventSystemStats>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSystem")
            .field("handlers", &"[handlers]")
            .field("stats", &"[stats]")
            .finish()
    }
}

impl EventSystem {
    /// Creates a new event system with no registered handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventSystemStats::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a handler for a domain event.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use ranksync_event_system::*;
    /// # async fn demo(events: std::sync::Arc<EventSystem>) -> Result<(), EventError> {
    /// let id = events.subscribe(|event: PlayerLinkedEvent| {
    ///     println!("linked {}", event.identity);
    ///     Ok(())
    /// }).await?;
    /// events.unsubscribe(id).await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn subscribe<E, F>(&self, handler: F) -> Result<SubscriptionId, EventError>
    where
        E: SyncEvent + 'static,
        F: Fn(E) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let event_key = format!("sync:{}", E::EVENT_NAME);
        self.register_typed_handler(event_key, handler).await
    }

    /// Publishes a domain event to every subscriber.
    pub async fn publish<E>(&self, event: &E) -> Result<(), EventError>
    where
        E: SyncEvent,
    {
        let event_key = format!("sync:{}", E::EVENT_NAME);
        self.emit_event(&event_key, event).await
    }

    /// Registers a handler under an arbitrary event key.
    pub async fn on<T, F>(&self, event_key: &str, handler: F) -> Result<SubscriptionId, EventError>
    where
        T: Event + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.register_typed_handler(event_key.to_string(), handler)
            .await
    }

    /// Emits an event under an arbitrary event key.
    pub async fn emit<T>(&self, event_key: &str, event: &T) -> Result<(), EventError>
    where
        T: Event,
    {
        self.emit_event(event_key, event).await
    }

    /// Removes a single registration. Returns false when it was already gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut handlers = self.handlers.write().await;
            let mut removed = false;
            handlers.retain(|_, list| {
                let before = list.len();
                list.retain(|registration| registration.id != id);
                removed |= list.len() != before;
                !list.is_empty()
            });
            removed
        };

        if removed {
            let mut stats = self.stats.write().await;
            stats.total_handlers = stats.total_handlers.saturating_sub(1);
            debug!("🗑️ Unsubscribed {}", id);
        }
        removed
    }

    /// Removes all handlers whose event key contains `pattern`.
    pub async fn remove_handlers(&self, pattern: &str) -> usize {
        let mut removed_count = 0;
        {
            let mut handlers = self.handlers.write().await;
            handlers.retain(|key, list| {
                if key.contains(pattern) {
                    removed_count += list.len();
                    false
                } else {
                    true
                }
            });
        }

        if removed_count > 0 {
            let mut stats = self.stats.write().await;
            stats.total_handlers = stats.total_handlers.saturating_sub(removed_count);
            info!("🗑️ Removed {} handlers matching pattern '{}'", removed_count, pattern);
        }

        removed_count
    }

    /// Gets all registered event keys
    pub async fn get_registered_events(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        handlers.keys().cloned().collect()
    }

    /// Checks if handlers are registered for a specific event key
    pub async fn has_handlers(&self, event_key: &str) -> bool {
        let handlers = self.handlers.read().await;
        handlers.contains_key(event_key)
    }

    /// Gets the number of handlers for a specific event key
    pub async fn get_handler_count(&self, event_key: &str) -> usize {
        let handlers = self.handlers.read().await;
        handlers.get(event_key).map(|h| h.len()).unwrap_or(0)
    }

    /// Gets the current event system statistics
    pub async fn get_stats(&self) -> EventSystemStats {
        self.stats.read().await.clone()
    }

    async fn register_typed_handler<T, F>(
        &self,
        event_key: String,
        handler: F,
    ) -> Result<SubscriptionId, EventError>
    where
        T: Event + 'static,
        F: Fn(T) -> Result<(), EventError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler_name = format!("{}::{}", event_key, T::type_name());
        let typed_handler = TypedEventHandler::new(handler_name, handler);
        let handler_arc: Arc<dyn EventHandler> = Arc::new(typed_handler);

        {
            let mut handlers = self.handlers.write().await;
            handlers
                .entry(event_key.clone())
                .or_insert_with(Vec::new)
                .push(Registration {
                    id,
                    handler: handler_arc,
                });
        }

        let mut stats = self.stats.write().await;
        stats.total_handlers += 1;

        debug!("📝 Registered handler {} for {}", id, event_key);
        Ok(id)
    }

    /// Serializes the event once and runs every matching handler in order.
    ///
    /// Handler failures are logged and counted but never stop the remaining
    /// handlers and never fail the emission.
    async fn emit_event<T>(&self, event_key: &str, event: &T) -> Result<(), EventError>
    where
        T: Event,
    {
        let data = event.serialize()?;

        // Copy the list out so no lock is held while handlers run.
        let snapshot: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().await;
            match handlers.get(event_key) {
                Some(list) => list.iter().map(|r| r.handler.clone()).collect(),
                None => Vec::new(),
            }
        };

        if snapshot.is_empty() {
            debug!("No handlers for event: {}", event_key);
            return Ok(());
        }

        debug!("📤 Emitting {} to {} handlers", event_key, snapshot.len());

        let mut failures = 0u64;
        for handler in &snapshot {
            if let Err(e) = handler.handle(&data).await {
                failures += 1;
                error!("❌ Handler {} failed: {}", handler.handler_name(), e);
            }
        }

        let mut stats = self.stats.write().await;
        stats.events_emitted += 1;
        stats.handler_failures += failures;

        Ok(())
    }
}

impl Default for EventSystem {
    fn default() -> Self {
        Self::new()
    }
}
