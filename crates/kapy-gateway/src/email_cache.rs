//! Bounded LRU for email reply threading (chat id → session id).
//!
//! The email channel pins replies to the session that produced the
//! original message; the cache is bounded so long-running deployments
//! cannot grow it without limit.

use std::collections::HashMap;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct ReplySessionCache {
    capacity: usize,
    map: HashMap<String, String>,
    order: Vec<String>,
}

impl Default for ReplySessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ReplySessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn set(&mut self, chat_id: &str, session_id: &str) {
        if self.map.insert(chat_id.to_string(), session_id.to_string()).is_some() {
            self.order.retain(|k| k != chat_id);
        }
        self.order.push(chat_id.to_string());
        while self.map.len() > self.capacity {
            let oldest = self.order.remove(0);
            self.map.remove(&oldest);
        }
    }

    pub fn get(&mut self, chat_id: &str) -> Option<String> {
        let value = self.map.get(chat_id).cloned()?;
        // Refresh recency on read.
        self.order.retain(|k| k != chat_id);
        self.order.push(chat_id.to_string());
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = ReplySessionCache::new(2);
        cache.set("a", "s1");
        cache.set("b", "s2");
        cache.get("a");
        cache.set("c", "s3");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap(), "s1");
        assert_eq!(cache.get("c").unwrap(), "s3");
    }

    #[test]
    fn overwrite_refreshes_recency() {
        let mut cache = ReplySessionCache::new(2);
        cache.set("a", "s1");
        cache.set("b", "s2");
        cache.set("a", "s9");
        cache.set("c", "s3");
        assert_eq!(cache.get("a").unwrap(), "s9");
        assert!(cache.get("b").is_none());
    }
}
