//! Request extras: the opaque per-call context (usually auth headers) that
//! partitions cells and cache entries.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// Extra headers merged into every request made on behalf of a variable.
///
/// Two reads of the same variable under different extras are different
/// identities: they get separate cells in the store and separate entries in any
/// user-scoped cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestExtras {
    headers: BTreeMap<String, String>,
}

impl RequestExtras {
    /// Creates an empty set of extras.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header.
    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Iterates over the headers in name order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether any headers are set.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// A stable string identifying these extras, or `None` if there are none.
    ///
    /// Headers are kept in a sorted map, so two sets of extras with the same
    /// headers always produce the same key regardless of insertion order. Names
    /// and values are length prefixed, so no header content can make two
    /// different sets collide.
    pub fn key(&self) -> Option<Arc<str>> {
        if self.headers.is_empty() {
            return None;
        }
        let key = self
            .headers
            .iter()
            .map(|(name, value)| {
                format!("{}:{name}{}:{value}", name.len(), value.len())
            })
            .collect::<String>();
        Some(key.into())
    }
}
