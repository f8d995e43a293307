//! Client-side reconciliation engine.
//!
//! Consumes the inbound [`Command`] stream and merges committed objects
//! with the transient previews other participants broadcast while still
//! dragging. Previews are keyed by the gesture's identity (shape variant
//! plus anchor point, or a stroke's first point) and resolve last-write-wins;
//! only a final delivery ever reaches a committed collection.

use std::collections::HashMap;

use protocol::{
    ChatEntry, Command, Point, RosterUpdate, Shape, ShapeKind, Stroke, TextBlock,
};

use crate::surface::RenderSurface;

/// What a received command meant for the local participant.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// Board content or membership changed; the rendering collaborator
    /// should redraw.
    Updated,
    /// The server asked the local user, as manager, to admit `target`.
    ApprovalRequest(String),
    /// Fatal notice (denial, kick, duplicate name); the connection is over.
    Disconnected(String),
    /// Command had no local effect.
    Ignored,
}

pub struct Board {
    local_user: String,

    strokes: Vec<Stroke>,
    shapes: Vec<Shape>,
    texts: Vec<TextBlock>,

    // live previews of other users' in-progress gestures
    shape_previews: HashMap<(ShapeKind, Point), Shape>,
    stroke_previews: HashMap<Point, Stroke>,

    roster: Vec<String>,
    chat: Vec<ChatEntry>,
    manager: Option<String>,
}

impl Board {
    pub fn new(local_user: &str) -> Self {
        Board {
            local_user: local_user.to_owned(),
            strokes: Vec::new(),
            shapes: Vec::new(),
            texts: Vec::new(),
            shape_previews: HashMap::new(),
            stroke_previews: HashMap::new(),
            roster: Vec::new(),
            chat: Vec::new(),
            manager: None,
        }
    }

    /// Merge one inbound command into local state.
    pub fn apply(&mut self, cmd: Command) -> BoardEvent {
        match cmd {
            Command::Stroke { stroke, .. } => self.apply_stroke(stroke),
            Command::Shape { shape, .. } => self.apply_shape(shape),
            Command::Text { text, .. } => {
                self.texts.push(text);
                BoardEvent::Updated
            }
            Command::Clear => {
                // committed collections, previews and chat go together
                self.strokes.clear();
                self.shapes.clear();
                self.texts.clear();
                self.shape_previews.clear();
                self.stroke_previews.clear();
                self.chat.clear();
                BoardEvent::Updated
            }
            Command::Chat { username, text } => {
                self.chat.push(ChatEntry { username, text });
                BoardEvent::Updated
            }
            Command::User { update } => self.apply_roster(update),
            Command::MgrInfo { manager } => {
                self.manager = Some(manager);
                BoardEvent::Updated
            }
            Command::Bye { username, reason } => match reason {
                Some(reason) => BoardEvent::Disconnected(reason),
                None => {
                    // departed users keep their committed drawings
                    self.roster.retain(|name| name != &username);
                    BoardEvent::Updated
                }
            },
            Command::Auth {
                target,
                verdict: None,
            } if self.local_is_manager() => BoardEvent::ApprovalRequest(target),
            Command::Auth { .. } | Command::Hello { .. } | Command::Kick { .. } => {
                BoardEvent::Ignored
            }
        }
    }

    // Incremental stroke deliveries for one gesture share a start point;
    // each one is an authoritative overwrite, so replaying or re-rendering
    // never accumulates duplicate segments.
    fn apply_stroke(&mut self, stroke: Stroke) -> BoardEvent {
        let Some(anchor) = stroke.start_point() else {
            return BoardEvent::Ignored;
        };
        if stroke.intermediate {
            self.stroke_previews.insert(anchor, stroke);
        } else {
            self.stroke_previews.remove(&anchor);
            self.strokes.push(stroke);
        }
        BoardEvent::Updated
    }

    fn apply_shape(&mut self, shape: Shape) -> BoardEvent {
        let key = shape.preview_key();
        if shape.intermediate {
            // last write wins per in-progress drag
            self.shape_previews.insert(key, shape);
        } else {
            self.shape_previews.remove(&key);
            self.shapes.push(shape);
        }
        BoardEvent::Updated
    }

    fn apply_roster(&mut self, update: RosterUpdate) -> BoardEvent {
        match update {
            RosterUpdate::Full(names) => {
                self.roster = names;
            }
            RosterUpdate::Joined(name) => {
                if !self.roster.contains(&name) {
                    self.roster.push(name);
                }
            }
        }
        BoardEvent::Updated
    }

    /// Full redraw in layer order: committed shapes as backdrop, text above,
    /// freehand ink topmost, then live previews over everything.
    pub fn render(&self, surface: &mut dyn RenderSurface) {
        surface.clear();
        for shape in &self.shapes {
            surface.draw_shape(shape);
        }
        for text in &self.texts {
            surface.draw_text(text);
        }
        for stroke in &self.strokes {
            surface.draw_stroke(stroke);
        }
        for shape in self.shape_previews.values() {
            surface.draw_shape(shape);
        }
        for stroke in self.stroke_previews.values() {
            surface.draw_stroke(stroke);
        }
    }

    fn local_is_manager(&self) -> bool {
        self.manager.as_deref() == Some(self.local_user.as_str())
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    pub fn texts(&self) -> &[TextBlock] {
        &self.texts
    }

    pub fn preview_count(&self) -> usize {
        self.shape_previews.len() + self.stroke_previews.len()
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    pub fn chat(&self) -> &[ChatEntry] {
        &self.chat
    }

    pub fn manager(&self) -> Option<&str> {
        self.manager.as_deref()
    }
}
