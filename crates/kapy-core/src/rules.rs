//! Channel rules loader — injects channel-specific context into prompts.
//!
//! Each channel has a `rules/<channel>.md` file describing the interaction
//! context (formatting rules, tone, limitations) so the agent understands
//! how it is being accessed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{info, warn};

pub struct RulesLoader {
    rules_dir: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl RulesLoader {
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: rules_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Raw rules markdown for a channel, `None` if the file is missing.
    pub fn get_rules(&self, channel: &str) -> Option<String> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.get(channel) {
                return Some(cached.clone());
            }
        }

        let path = self.rules_dir.join(format!("{channel}.md"));
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let content = raw.trim().to_string();
                info!(channel, chars = content.len(), "loaded channel rules");
                self.cache
                    .lock()
                    .unwrap()
                    .insert(channel.to_string(), content.clone());
                Some(content)
            }
            Err(_) => {
                warn!(channel, path = %path.display(), "no rules file for channel");
                None
            }
        }
    }

    /// Prompt prefix wrapping the rules, empty when no rules exist.
    pub fn system_prompt(&self, channel: &str) -> String {
        match self.get_rules(channel) {
            Some(rules) if !rules.is_empty() => {
                format!("[CHANNEL CONTEXT]\n{rules}\n[END CHANNEL CONTEXT]\n\n")
            }
            _ => String::new(),
        }
    }

    /// Drop cached rules so the next read hits disk again.
    pub fn reload(&self, channel: Option<&str>) {
        let mut cache = self.cache.lock().unwrap();
        match channel {
            Some(name) => {
                cache.remove(name);
            }
            None => cache.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_rules_in_context_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("telegram.md"), "Keep replies short.\n").unwrap();
        let loader = RulesLoader::new(dir.path());

        let prompt = loader.system_prompt("telegram");
        assert!(prompt.starts_with("[CHANNEL CONTEXT]\n"));
        assert!(prompt.contains("Keep replies short."));
        assert!(prompt.ends_with("[END CHANNEL CONTEXT]\n\n"));
    }

    #[test]
    fn missing_rules_yield_empty_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let loader = RulesLoader::new(dir.path());
        assert_eq!(loader.system_prompt("discord"), "");
    }

    #[test]
    fn reload_clears_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("email.md");
        std::fs::write(&path, "v1").unwrap();
        let loader = RulesLoader::new(dir.path());
        assert_eq!(loader.get_rules("email").unwrap(), "v1");

        std::fs::write(&path, "v2").unwrap();
        // Still cached.
        assert_eq!(loader.get_rules("email").unwrap(), "v1");
        loader.reload(Some("email"));
        assert_eq!(loader.get_rules("email").unwrap(), "v2");
    }
}
