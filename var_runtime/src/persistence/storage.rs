use crate::error::Result;
use futures::channel::mpsc;
use or_poisoned::OrPoisoned;
use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

const KEY_PREFIX: &str = "vars-session-";
const KEY_SEPARATOR: &str = "-var-";

/// A key-value storage area with browser storage semantics.
pub trait StorageArea: Debug + Send + Sync + 'static {
    /// The value stored under `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    fn set(&self, key: &str, value: String) -> Result<()>;

    /// Removes `key`.
    fn remove(&self, key: &str);

    /// Every stored key.
    fn keys(&self) -> Vec<String>;
}

/// A change made to a storage area by another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// The key that changed.
    pub key: String,
    /// Its new value, or `None` if it was removed.
    pub new_value: Option<String>,
}

/// The key a persisted variable is stored under.
pub fn session_key(session_id: &str, uid: &str) -> String {
    format!("{KEY_PREFIX}{session_id}{KEY_SEPARATOR}{uid}")
}

/// Splits a key produced by [`session_key`] into its session id and variable
/// `uid`.
pub fn parse_session_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix(KEY_PREFIX)?.split_once(KEY_SEPARATOR)
}

#[derive(Debug, Default)]
struct SharedArea {
    entries: RwLock<BTreeMap<String, String>>,
    listeners: RwLock<Vec<(u64, mpsc::UnboundedSender<StorageEvent>)>>,
    next_tab: AtomicU64,
}

/// An in-memory [`StorageArea`], shareable between simulated tabs.
///
/// Like browser storage, a write is announced to every *other* tab through
/// [`MemoryStorage::events`]; the tab that wrote it is not notified.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    shared: Arc<SharedArea>,
    tab: u64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Creates an empty storage area, seen from a first tab.
    pub fn new() -> Self {
        Self {
            shared: Default::default(),
            tab: 0,
        }
    }

    /// The same storage area, seen from a new tab.
    pub fn open_tab(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            tab: self.shared.next_tab.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// Changes made by other tabs from now on.
    pub fn events(&self) -> mpsc::UnboundedReceiver<StorageEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.shared
            .listeners
            .write()
            .or_poisoned()
            .push((self.tab, tx));
        rx
    }

    fn announce(&self, key: &str, new_value: Option<String>) {
        let event = StorageEvent {
            key: key.to_string(),
            new_value,
        };
        self.shared
            .listeners
            .write()
            .or_poisoned()
            .retain(|(tab, tx)| {
                *tab == self.tab || tx.unbounded_send(event.clone()).is_ok()
            });
    }
}

impl StorageArea for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.shared.entries.read().or_poisoned().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.shared
            .entries
            .write()
            .or_poisoned()
            .insert(key.to_string(), value.clone());
        self.announce(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) {
        let removed = self.shared.entries.write().or_poisoned().remove(key);
        if removed.is_some() {
            self.announce(key, None);
        }
    }

    fn keys(&self) -> Vec<String> {
        self.shared
            .entries
            .read()
            .or_poisoned()
            .keys()
            .cloned()
            .collect()
    }
}
