//! User-visible notifications, such as action failures.

use or_poisoned::OrPoisoned;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// The key every action failure is reported under, so that repeated failures
/// show up once.
pub const ACTION_ERROR_KEY: &str = "action-error";

/// How a notification is presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Something failed.
    Error,
    /// Something may need attention.
    Warning,
    /// Something worked.
    Success,
    /// Informational.
    #[default]
    None,
}

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Notifications with the same key replace each other instead of stacking.
    #[serde(default)]
    pub key: Option<String>,
    /// The headline.
    #[serde(default)]
    pub title: String,
    /// The body.
    #[serde(default)]
    pub message: String,
    /// The presentation.
    #[serde(default)]
    pub status: NotificationStatus,
}

impl Notification {
    /// The notification shown when an action fails.
    pub fn action_error(message: impl Into<String>) -> Self {
        Self {
            key: Some(ACTION_ERROR_KEY.into()),
            title: "Error".into(),
            message: message.into(),
            status: NotificationStatus::Error,
        }
    }
}

/// The notifications waiting to be shown, oldest first.
#[derive(Debug, Default)]
pub struct Notifications {
    queue: RwLock<Vec<Notification>>,
}

impl Notifications {
    /// Queues a notification. One with the same key as a queued notification
    /// replaces it.
    pub fn push(&self, notification: Notification) {
        let mut queue = self.queue.write().or_poisoned();
        let existing = notification.key.as_ref().and_then(|key| {
            queue
                .iter_mut()
                .find(|queued| queued.key.as_ref() == Some(key))
        });
        match existing {
            Some(queued) => *queued = notification,
            None => queue.push(notification),
        }
    }

    /// Every queued notification.
    pub fn all(&self) -> Vec<Notification> {
        self.queue.read().or_poisoned().clone()
    }

    /// Removes the notification with the given key.
    pub fn dismiss(&self, key: &str) {
        self.queue
            .write()
            .or_poisoned()
            .retain(|queued| queued.key.as_deref() != Some(key));
    }

    /// Removes and returns every queued notification.
    pub fn drain(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.queue.write().or_poisoned())
    }
}
