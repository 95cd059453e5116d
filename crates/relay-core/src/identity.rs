//! Client identity types.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter backing connection keys and generated identities.
static KEY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique key for one live connection.
///
/// Several connections may share an [`Identity`]; each still gets its own key
/// and its own registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(u64);

impl ClientKey {
    /// Allocate the next key.
    #[must_use]
    pub fn next() -> Self {
        Self(KEY_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw key value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Who a client is, as resolved at the connection boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Stable identifier used for addressing.
    pub id: String,
    /// Display label.
    pub label: String,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// Generate an anonymous identity with a unique id.
    #[must_use]
    pub fn generate(label: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let counter = KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::new(format!("anon-{:x}", timestamp.wrapping_add(counter)), label)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.label)
    }
}
