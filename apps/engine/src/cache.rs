use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

pub fn event_key(event_id: &str) -> String {
    format!("event:{event_id}")
}

pub fn proposal_key(proposal_id: &str, event_id: &str) -> String {
    format!("proposal:{proposal_id}:{event_id}")
}

pub fn proposal_pattern(event_id: &str) -> String {
    format!("proposal:*:{event_id}")
}

/// Best-effort TTL key/value store. The backing transport is evictable, so
/// every caller must tolerate a miss after a successful `set`; the API has
/// no error channel for the same reason.
pub struct Cache {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Glob-style scan (`prefix:*:suffix`). Expired entries are pruned as a
    /// side effect so the scan never reports ghosts.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, e| e.expires_at > now);
        entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == key;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(i) => rest = &rest[i + part.len()..],
            None => return false,
        }
    }
    last.is_empty() || rest.ends_with(last)
}
