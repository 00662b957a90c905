//! Live bots by name, in connection order.

use super::Bot;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registry of connected bots.
///
/// Written only while the lifecycle manager starts, stops or force-shuts a bot
/// down; everything else reads.
#[derive(Default)]
pub struct BotRegistry {
    bots: RwLock<Vec<Arc<dyn Bot>>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bot, replacing one with the same name. Returns the replaced bot.
    pub async fn insert(&self, bot: Arc<dyn Bot>) -> Option<Arc<dyn Bot>> {
        let mut bots = self.bots.write().await;
        match bots.iter().position(|b| b.name() == bot.name()) {
            Some(index) => Some(std::mem::replace(&mut bots[index], bot)),
            None => {
                bots.push(bot);
                None
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Bot>> {
        let bots = self.bots.read().await;
        bots.iter().find(|b| b.name() == name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<dyn Bot>> {
        let mut bots = self.bots.write().await;
        let index = bots.iter().position(|b| b.name() == name)?;
        Some(bots.remove(index))
    }

    /// All bots in connection order.
    pub async fn all(&self) -> Vec<Arc<dyn Bot>> {
        self.bots.read().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        let bots = self.bots.read().await;
        bots.iter().map(|b| b.name().to_string()).collect()
    }

    pub async fn len(&self) -> usize {
        self.bots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bots.read().await.is_empty()
    }

    /// Empties the registry, returning the bots in reverse connection order.
    pub async fn drain_reverse(&self) -> Vec<Arc<dyn Bot>> {
        let mut bots = self.bots.write().await;
        let mut drained: Vec<Arc<dyn Bot>> = bots.drain(..).collect();
        drained.reverse();
        drained
    }
}
