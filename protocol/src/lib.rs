//! Shared wire types for the whiteboard session protocol.
//!
//! Every message exchanged between a client and the session server is a
//! single [`Command`] frame, encoded by [`BoardCodec`]. The same type flows
//! in both directions: clients send gestures and admission traffic, the
//! server relays them plus membership bookkeeping.

mod codec;

pub use codec::BoardCodec;

/// A 2-D canvas coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }
}

/// RGB drawing color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Color { r, g, b }
    }
}

/// A freehand stroke: an append-only point sequence while authored.
///
/// While the gesture is still in progress the stroke travels with
/// `intermediate: true`; the finished point set arrives as the same logical
/// stroke with `intermediate: false`. The start point anchors the stroke's
/// identity across incremental deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct Stroke {
    pub color: Color,
    pub width: f32,
    pub points: Vec<Point>,
    pub intermediate: bool,
}

impl Stroke {
    pub fn new(color: Color, width: f32, intermediate: bool) -> Self {
        Stroke {
            color,
            width,
            points: Vec::new(),
            intermediate,
        }
    }

    pub fn add_point(&mut self, p: Point) {
        self.points.push(p);
    }

    pub fn start_point(&self) -> Option<Point> {
        self.points.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// The four shape variants. They differ only in how the rendering
/// collaborator draws them; structurally they are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Rectangle,
    Oval,
    Line,
    Triangle,
}

/// Normalized bounding box shared by the closed shape variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub top_left: Point,
    pub width: i32,
    pub height: i32,
}

/// A two-point shape; `end` is mutable until the drag finalizes.
#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub kind: ShapeKind,
    pub start: Point,
    pub end: Point,
    pub width: f32,
    pub color: Color,
    pub intermediate: bool,
}

impl Shape {
    pub fn new(kind: ShapeKind, start: Point, end: Point, width: f32, color: Color) -> Self {
        Shape {
            kind,
            start,
            end,
            width,
            color,
            intermediate: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self.kind, ShapeKind::Line)
    }

    /// Bounding box for closed variants; `None` for open ones.
    pub fn bounds(&self) -> Option<Bounds> {
        if !self.is_closed() {
            return None;
        }
        Some(Bounds {
            top_left: Point::new(self.start.x.min(self.end.x), self.start.y.min(self.end.y)),
            width: (self.start.x - self.end.x).abs(),
            height: (self.start.y - self.end.y).abs(),
        })
    }

    /// Identity of an in-progress shape drag: variant plus anchor point.
    pub fn preview_key(&self) -> (ShapeKind, Point) {
        (self.kind, self.start)
    }
}

/// Typed text, immutable once placed; text has no intermediate phase.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub text: String,
    pub pos: Point,
    pub font_size: u16,
    pub color: Color,
}

/// One chat log line, ordered by arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub username: String,
    pub text: String,
}

/// Manager's answer to a pending-approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Yes,
    No,
}

/// Roster maintenance: a single join vs a wholesale list replacement.
#[derive(Debug, Clone, PartialEq)]
pub enum RosterUpdate {
    Joined(String),
    Full(Vec<String>),
}

/// The wire message: exactly one variant per frame, unit of broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Mandatory first message on every connection.
    Hello { username: String },
    /// Departure notice; a populated reason marks a fatal disconnect
    /// (denial, kick) rather than a plain leave.
    Bye {
        username: String,
        reason: Option<String>,
    },
    Chat { username: String, text: String },
    /// Approval traffic: `verdict: None` is the server's request to the
    /// manager, `Some(_)` is the manager's reply.
    Auth {
        target: String,
        verdict: Option<Verdict>,
    },
    Kick { target: String },
    User { update: RosterUpdate },
    MgrInfo { manager: String },
    Clear,
    Stroke {
        stroke: Stroke,
        author: Option<String>,
    },
    Shape {
        shape: Shape,
        author: Option<String>,
    },
    Text {
        text: TextBlock,
        author: Option<String>,
    },
}
