use std::collections::HashMap;
use std::sync::Mutex;

pub type ClientId = String;

/// Live-connection registry. The default backing is a single-process map;
/// the trait exists so a shared external store can replace it in a
/// multi-instance deployment without touching the delivery engines.
pub trait PresenceStore: Send + Sync {
    /// Record `handle` as the active connection for `user_id`. Last writer
    /// wins: the previously registered handle, if any, is returned and no
    /// longer receives user-targeted sends.
    fn register(&self, user_id: &str, handle: ClientId) -> Option<ClientId>;

    /// Remove the registration for `user_id`, but only if `handle` is still
    /// the active one. A stale disconnect after a reconnect must not knock
    /// out the newer connection.
    fn unregister(&self, user_id: &str, handle: &str) -> bool;

    fn is_online(&self, user_id: &str) -> bool;

    fn handle_for(&self, user_id: &str) -> Option<ClientId>;
}

#[derive(Default)]
pub struct InMemoryPresence {
    inner: Mutex<HashMap<String, ClientId>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceStore for InMemoryPresence {
    fn register(&self, user_id: &str, handle: ClientId) -> Option<ClientId> {
        let mut map = self.inner.lock().expect("presence map poisoned");
        let displaced = map.insert(user_id.to_string(), handle);
        if displaced.is_some() {
            log::info!("[PRESENCE] User {} reconnected, displacing previous handle", user_id);
        }
        displaced
    }

    fn unregister(&self, user_id: &str, handle: &str) -> bool {
        let mut map = self.inner.lock().expect("presence map poisoned");
        match map.get(user_id) {
            Some(current) if current == handle => {
                map.remove(user_id);
                true
            }
            _ => false,
        }
    }

    fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().expect("presence map poisoned").contains_key(user_id)
    }

    fn handle_for(&self, user_id: &str) -> Option<ClientId> {
        self.inner.lock().expect("presence map poisoned").get(user_id).cloned()
    }
}
