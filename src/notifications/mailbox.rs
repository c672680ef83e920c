//! Cached mailbox state and the rules for folding server truth into it.

use std::collections::HashMap;

use super::Notification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Added locally; the insert may not have reached the store yet.
    Insert,
    /// Marked read locally; the update may not have reached the store yet.
    MarkRead,
}

#[derive(Debug, Clone)]
struct Entry {
    notification: Notification,
    pending: Option<Pending>,
    in_flight: bool,
    /// Loads issued at or before this sequence predate the settled write
    /// and must not undo it.
    settled_seq: u64,
}

impl Entry {
    fn shields(&self, load_seq: u64) -> Option<Pending> {
        if self.in_flight || load_seq <= self.settled_seq {
            self.pending
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct MailboxState {
    user_id: Option<String>,
    entries: Vec<Entry>,
    last_id_ms: i64,
}

pub fn id_millis(id: &str) -> Option<i64> {
    id.strip_prefix("notification_")?.parse().ok()
}

impl MailboxState {
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Switch the cache to `user_id`, dropping another user's entries.
    pub fn scope_to(&mut self, user_id: &str) {
        if self.user_id.as_deref() != Some(user_id) {
            self.entries.clear();
            self.last_id_ms = 0;
            self.user_id = Some(user_id.to_string());
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Millisecond stamp for a new id, strictly after every id seen so far.
    pub fn next_id_millis(&mut self, now_ms: i64) -> i64 {
        let ms = now_ms.max(self.last_id_ms + 1);
        self.last_id_ms = ms;
        ms
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.entries.iter().map(|e| e.notification.clone()).collect()
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.notification.read).count()
    }

    pub fn pending(&self, id: &str) -> Option<Pending> {
        self.entries
            .iter()
            .find(|e| e.notification.id == id)
            .and_then(|e| if e.in_flight { e.pending } else { None })
    }

    pub fn prepend(&mut self, notification: Notification) {
        if let Some(ms) = id_millis(&notification.id) {
            self.last_id_ms = self.last_id_ms.max(ms);
        }
        self.entries.insert(
            0,
            Entry {
                notification,
                pending: Some(Pending::Insert),
                in_flight: true,
                settled_seq: 0,
            },
        );
    }

    /// Mark one entry read. Returns false if it is not cached.
    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.notification.id == id) else {
            return false;
        };
        entry.notification.read = true;
        if entry.pending != Some(Pending::Insert) || !entry.in_flight {
            entry.pending = Some(Pending::MarkRead);
        }
        entry.in_flight = true;
        true
    }

    /// Mark every unread entry read and return their ids.
    pub fn mark_all_read(&mut self) -> Vec<String> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.notification.read)
            .map(|e| e.notification.id.clone())
            .collect();
        for id in &ids {
            self.mark_read(id);
        }
        ids
    }

    /// A write for `ids` finished. On success the local change is shielded
    /// from loads issued up to `load_seq`; on failure the next load decides.
    pub fn settle(&mut self, ids: &[String], succeeded: bool, load_seq: u64) {
        for entry in self.entries.iter_mut() {
            if ids.contains(&entry.notification.id) {
                entry.in_flight = false;
                entry.settled_seq = if succeeded { load_seq } else { 0 };
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.notification.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replace the cache with `fetched` (already newest first), keeping
    /// local writes the fetch cannot have seen.
    pub fn apply_load(&mut self, user_id: &str, fetched: Vec<Notification>, load_seq: u64) {
        self.scope_to(user_id);

        let mut shielded: HashMap<String, (Pending, Entry)> = self
            .entries
            .drain(..)
            .filter_map(|e| {
                e.shields(load_seq)
                    .map(|pending| (e.notification.id.clone(), (pending, e)))
            })
            .collect();

        let mut entries = Vec::with_capacity(fetched.len() + shielded.len());
        for mut notification in fetched {
            if let Some(ms) = id_millis(&notification.id) {
                self.last_id_ms = self.last_id_ms.max(ms);
            }
            match shielded.remove(&notification.id) {
                Some((_, mut local)) => {
                    if local.notification.read {
                        notification.read = true;
                    }
                    local.notification = notification;
                    entries.push(local);
                }
                None => entries.push(Entry {
                    notification,
                    pending: None,
                    in_flight: false,
                    settled_seq: 0,
                }),
            }
        }

        // Inserts the server has not seen yet. A shielded mark-read whose row
        // is gone was deleted elsewhere.
        entries.extend(
            shielded
                .into_values()
                .filter(|(pending, _)| *pending == Pending::Insert)
                .map(|(_, entry)| entry),
        );
        entries.sort_by(|a, b| b.notification.timestamp.cmp(&a.notification.timestamp));
        self.entries = entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::Severity;
    use crate::testing::start_time;
    use serde_json::json;

    fn note(ms: i64, read: bool) -> Notification {
        Notification {
            id: format!("notification_{}", ms),
            user_id: "u1".to_string(),
            timestamp: start_time() + chrono::Duration::milliseconds(ms),
            message: format!("message {}", ms),
            severity: Severity::Info,
            read,
            data: json!({}),
        }
    }

    #[test]
    fn test_id_millis() {
        assert_eq!(id_millis("notification_1710493200000"), Some(1710493200000));
        assert_eq!(id_millis("other_1"), None);
        assert_eq!(id_millis("notification_x"), None);
    }

    #[test]
    fn test_next_id_is_strictly_increasing() {
        let mut state = MailboxState::default();
        assert_eq!(state.next_id_millis(100), 100);
        assert_eq!(state.next_id_millis(100), 101);
        assert_eq!(state.next_id_millis(50), 102);
        assert_eq!(state.next_id_millis(500), 500);
    }

    #[test]
    fn test_load_replaces_settled_entries() {
        let mut state = MailboxState::default();
        state.apply_load("u1", vec![note(2, false), note(1, true)], 1);
        assert_eq!(state.unread_count(), 1);

        state.apply_load("u1", vec![note(3, false)], 2);
        let ids: Vec<_> = state.notifications().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["notification_3"]);
    }

    #[test]
    fn test_load_keeps_in_flight_insert() {
        let mut state = MailboxState::default();
        state.scope_to("u1");
        state.prepend(note(5, false));

        state.apply_load("u1", vec![note(1, false)], 1);
        assert_eq!(state.notifications().len(), 2);
        assert_eq!(state.notifications()[0].id, "notification_5");
        assert_eq!(state.pending("notification_5"), Some(Pending::Insert));
    }

    #[test]
    fn test_failed_insert_yields_to_next_load() {
        let mut state = MailboxState::default();
        state.scope_to("u1");
        state.prepend(note(5, false));
        state.settle(&["notification_5".to_string()], false, 1);

        state.apply_load("u1", vec![note(1, false)], 2);
        assert_eq!(state.notifications().len(), 1);
    }

    #[test]
    fn test_stale_load_cannot_undo_settled_mark_read() {
        let mut state = MailboxState::default();
        state.apply_load("u1", vec![note(1, false)], 1);
        assert!(state.mark_read("notification_1"));
        state.settle(&["notification_1".to_string()], true, 2);

        // Load 2 was issued before the update landed.
        state.apply_load("u1", vec![note(1, false)], 2);
        assert_eq!(state.unread_count(), 0);

        state.apply_load("u1", vec![note(1, false)], 3);
        assert_eq!(state.unread_count(), 1);
    }

    #[test]
    fn test_mark_all_read_returns_only_unread_ids() {
        let mut state = MailboxState::default();
        state.apply_load("u1", vec![note(3, false), note(2, true), note(1, false)], 1);

        let ids = state.mark_all_read();
        assert_eq!(ids, vec!["notification_3", "notification_1"]);
        assert_eq!(state.unread_count(), 0);
    }

    #[test]
    fn test_switching_user_drops_cache() {
        let mut state = MailboxState::default();
        state.scope_to("u1");
        state.prepend(note(1, false));

        state.apply_load("u2", vec![], 1);
        assert!(state.notifications().is_empty());
        assert_eq!(state.user_id(), Some("u2"));
    }
}
