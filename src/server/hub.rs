use crate::server::events::ServerEvent;
use crate::server::presence::{ClientId, PresenceStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;

/// Connection fan-out hub: maps client ids to their outbound channels and
/// tracks room membership. Rooms are plain string scopes; the personal room
/// of a user is keyed by the user id, a group room by the group id.
///
/// The maps are guarded by std mutexes and never held across an await; all
/// sends go through unbounded channels and are non-blocking.
pub struct Hub {
    clients: Mutex<HashMap<ClientId, UnboundedSender<Message>>>,
    rooms: Mutex<HashMap<String, HashSet<ClientId>>>,
    pub presence: Arc<dyn PresenceStore>,
}

impl Hub {
    pub fn new(presence: Arc<dyn PresenceStore>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            presence,
        }
    }

    pub fn attach(&self, client_id: &str, sender: UnboundedSender<Message>) {
        self.clients
            .lock()
            .expect("hub clients poisoned")
            .insert(client_id.to_string(), sender);
    }

    /// Drop a client and all of its room memberships.
    pub fn detach(&self, client_id: &str) {
        self.clients.lock().expect("hub clients poisoned").remove(client_id);
        let mut rooms = self.rooms.lock().expect("hub rooms poisoned");
        rooms.retain(|_, members| {
            members.remove(client_id);
            !members.is_empty()
        });
    }

    pub fn join_room(&self, room: &str, client_id: &str) {
        self.rooms
            .lock()
            .expect("hub rooms poisoned")
            .entry(room.to_string())
            .or_default()
            .insert(client_id.to_string());
    }

    pub fn leave_room(&self, room: &str, client_id: &str) {
        let mut rooms = self.rooms.lock().expect("hub rooms poisoned");
        if let Some(members) = rooms.get_mut(room) {
            members.remove(client_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    fn frame(event: &ServerEvent) -> Option<Message> {
        match serde_json::to_string(event) {
            Ok(json) => Some(Message::Text(json)),
            Err(e) => {
                log::error!("[HUB] Failed to serialize event: {}", e);
                None
            }
        }
    }

    pub fn send_to_client(&self, client_id: &str, event: &ServerEvent) {
        let Some(frame) = Self::frame(event) else { return };
        let clients = self.clients.lock().expect("hub clients poisoned");
        if let Some(sender) = clients.get(client_id) {
            // A send failure means the connection is tearing down; the read
            // loop handles cleanup.
            let _ = sender.send(frame);
        }
    }

    /// Deliver to every member of a room. A no-op when nobody is subscribed.
    pub fn send_to_room(&self, room: &str, event: &ServerEvent, exclude: Option<&str>) {
        let Some(frame) = Self::frame(event) else { return };
        let members: Vec<ClientId> = {
            let rooms = self.rooms.lock().expect("hub rooms poisoned");
            match rooms.get(room) {
                Some(members) => members
                    .iter()
                    .filter(|id| exclude != Some(id.as_str()))
                    .cloned()
                    .collect(),
                None => return,
            }
        };
        let clients = self.clients.lock().expect("hub clients poisoned");
        for id in members {
            if let Some(sender) = clients.get(&id) {
                let _ = sender.send(frame.clone());
            }
        }
    }

    /// Deliver to a user's personal room.
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        self.send_to_room(user_id, event, None);
    }

    /// Deliver to the live connection handle registered for a user, if any.
    pub fn send_to_handle(&self, user_id: &str, event: &ServerEvent) {
        if let Some(handle) = self.presence.handle_for(user_id) {
            self.send_to_client(&handle, event);
        }
    }

    /// System-wide broadcast (presence changes).
    pub fn broadcast_all(&self, event: &ServerEvent) {
        let Some(frame) = Self::frame(event) else { return };
        let clients = self.clients.lock().expect("hub clients poisoned");
        for sender in clients.values() {
            let _ = sender.send(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::presence::InMemoryPresence;
    use tokio::sync::mpsc;

    fn hub() -> Hub {
        Hub::new(Arc::new(InMemoryPresence::new()))
    }

    fn recv_event(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<serde_json::Value> {
        match rx.try_recv().ok()? {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn room_send_excludes_the_originator() {
        let hub = hub();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.attach("a", tx_a);
        hub.attach("b", tx_b);
        hub.join_room("g1", "a");
        hub.join_room("g1", "b");

        hub.send_to_room(
            "g1",
            &ServerEvent::Typing {
                sender_id: "user-a".into(),
                room_id: None,
                group_id: Some("g1".into()),
            },
            Some("a"),
        );

        assert!(recv_event(&mut rx_a).is_none());
        let frame = recv_event(&mut rx_b).unwrap();
        assert_eq!(frame["event"], "typing");
        assert_eq!(frame["data"]["groupId"], "g1");
    }

    #[tokio::test]
    async fn sending_to_an_empty_room_is_a_noop() {
        let hub = hub();
        hub.send_to_room("nobody-here", &ServerEvent::Connected, None);
    }

    #[tokio::test]
    async fn detach_removes_room_membership() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.attach("a", tx);
        hub.join_room("g1", "a");
        hub.detach("a");
        hub.send_to_room("g1", &ServerEvent::Connected, None);
        assert!(recv_event(&mut rx).is_none());
    }
}
