//! Server-held session state: committed drawing objects, the chat log,
//! membership and the pending-approval table.
//!
//! One store per process, guarded by a single coarse `tokio::sync::Mutex`.
//! Handlers mutate it and enqueue the matching broadcast while holding the
//! lock, so a replay snapshot taken under the same lock can neither miss a
//! committed object nor receive it twice.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use protocol::{ChatEntry, Shape, Stroke, TextBlock};

use crate::server_types::ConnId;

pub type SharedStore = Arc<Mutex<SessionStore>>;

/// Outcome of a `Hello` admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First approved member of the session, auto-approved.
    Manager,
    /// Parked until the manager resolves the request.
    Pending,
    /// Username already taken by a member or a parked user.
    Duplicate,
}

/// What a departing username was to the session, used to decide whether the
/// remaining members should hear about the departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    Member,
    Pending,
    Unknown,
}

/// Committed content cloned for the one-time replay to a new member.
pub struct ReplaySnapshot {
    pub chats: Vec<ChatEntry>,
    pub shapes: Vec<Shape>,
    pub texts: Vec<TextBlock>,
    pub strokes: Vec<Stroke>,
}

#[derive(Default)]
pub struct SessionStore {
    strokes: Vec<Stroke>,
    shapes: Vec<Shape>,
    texts: Vec<TextBlock>,
    chats: Vec<ChatEntry>,

    members: HashMap<String, ConnId>,
    pending: HashMap<String, ConnId>,
    manager: Option<String>,
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore::default()
    }

    pub fn new_shared() -> SharedStore {
        Arc::new(Mutex::new(SessionStore::new()))
    }

    /// Admission rule: the first approved member becomes manager, everyone
    /// after that is parked pending the manager's verdict. Duplicate names
    /// are refused outright.
    pub fn admit(&mut self, username: &str, id: ConnId) -> Admission {
        if self.members.contains_key(username) || self.pending.contains_key(username) {
            return Admission::Duplicate;
        }
        if self.members.is_empty() {
            self.members.insert(username.to_owned(), id);
            self.manager = Some(username.to_owned());
            Admission::Manager
        } else {
            self.pending.insert(username.to_owned(), id);
            Admission::Pending
        }
    }

    /// Atomic check-and-remove on the pending table. `None` means the user
    /// already disconnected and the verdict is a no-op.
    pub fn resolve_pending(&mut self, username: &str) -> Option<ConnId> {
        self.pending.remove(username)
    }

    /// Promote a resolved pending user to membership.
    pub fn insert_member(&mut self, username: &str, id: ConnId) {
        self.members.insert(username.to_owned(), id);
    }

    /// Idempotent removal across both tables.
    pub fn remove(&mut self, username: &str) -> Departure {
        if self.members.remove(username).is_some() {
            Departure::Member
        } else if self.pending.remove(username).is_some() {
            Departure::Pending
        } else {
            Departure::Unknown
        }
    }

    pub fn is_member(&self, username: &str) -> bool {
        self.members.contains_key(username)
    }

    pub fn member_id(&self, username: &str) -> Option<ConnId> {
        self.members.get(username).copied()
    }

    pub fn manager(&self) -> Option<&str> {
        self.manager.as_deref()
    }

    pub fn is_manager(&self, username: &str) -> bool {
        self.manager.as_deref() == Some(username)
    }

    pub fn manager_id(&self) -> Option<ConnId> {
        self.manager
            .as_deref()
            .and_then(|name| self.member_id(name))
    }

    /// Sorted member list for the roster replacement sent to new members.
    pub fn roster(&self) -> Vec<String> {
        let mut names: Vec<String> = self.members.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn commit_stroke(&mut self, stroke: Stroke) {
        debug_assert!(!stroke.intermediate);
        self.strokes.push(stroke);
    }

    pub fn commit_shape(&mut self, shape: Shape) {
        debug_assert!(!shape.intermediate);
        self.shapes.push(shape);
    }

    pub fn commit_text(&mut self, text: TextBlock) {
        self.texts.push(text);
    }

    pub fn commit_chat(&mut self, entry: ChatEntry) {
        self.chats.push(entry);
    }

    /// Wipes every committed collection at once; membership is untouched.
    pub fn clear(&mut self) {
        self.strokes.clear();
        self.shapes.clear();
        self.texts.clear();
        self.chats.clear();
    }

    pub fn replay_snapshot(&self) -> ReplaySnapshot {
        ReplaySnapshot {
            chats: self.chats.clone(),
            shapes: self.shapes.clone(),
            texts: self.texts.clone(),
            strokes: self.strokes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Color, Point, ShapeKind};

    #[test]
    fn first_user_becomes_manager_and_stays_manager() {
        let mut store = SessionStore::new();
        assert_eq!(store.admit("ana", 1), Admission::Manager);
        assert_eq!(store.manager(), Some("ana"));
        assert_eq!(store.admit("bo", 2), Admission::Pending);
        assert!(!store.is_member("bo"));

        let id = store.resolve_pending("bo").unwrap();
        store.insert_member("bo", id);
        assert!(store.is_member("bo"));
        assert_eq!(store.manager(), Some("ana"));
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut store = SessionStore::new();
        store.admit("ana", 1);
        store.admit("bo", 2);
        assert_eq!(store.admit("ana", 3), Admission::Duplicate);
        assert_eq!(store.admit("bo", 4), Admission::Duplicate);
    }

    #[test]
    fn member_and_pending_tables_are_mutually_exclusive() {
        let mut store = SessionStore::new();
        store.admit("ana", 1);
        store.admit("bo", 2);

        let id = store.resolve_pending("bo").unwrap();
        store.insert_member("bo", id);
        assert!(store.resolve_pending("bo").is_none());

        // departure right after approval leaves no stale entry anywhere
        assert_eq!(store.remove("bo"), Departure::Member);
        assert_eq!(store.remove("bo"), Departure::Unknown);
        assert!(!store.is_member("bo"));
        assert!(store.resolve_pending("bo").is_none());
    }

    #[test]
    fn resolving_a_disconnected_pending_user_is_a_noop() {
        let mut store = SessionStore::new();
        store.admit("ana", 1);
        store.admit("bo", 2);
        assert_eq!(store.remove("bo"), Departure::Pending);
        assert!(store.resolve_pending("bo").is_none());
    }

    #[test]
    fn clear_wipes_all_committed_collections() {
        let mut store = SessionStore::new();
        let mut stroke = Stroke::new(Color::BLACK, 2.0, false);
        stroke.add_point(Point::new(1, 1));
        store.commit_stroke(stroke);
        store.commit_shape(Shape::new(
            ShapeKind::Oval,
            Point::new(0, 0),
            Point::new(5, 5),
            1.0,
            Color::BLACK,
        ));
        store.commit_text(TextBlock {
            text: "hi".into(),
            pos: Point::new(2, 2),
            font_size: 12,
            color: Color::BLACK,
        });
        store.commit_chat(ChatEntry {
            username: "ana".into(),
            text: "hello".into(),
        });
        store.admit("ana", 1);

        store.clear();

        let snap = store.replay_snapshot();
        assert!(snap.chats.is_empty());
        assert!(snap.shapes.is_empty());
        assert!(snap.texts.is_empty());
        assert!(snap.strokes.is_empty());
        // membership survives a board clear
        assert!(store.is_member("ana"));
    }
}
