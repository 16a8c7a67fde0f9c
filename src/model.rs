use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const USERNAME_MIN_LEN: usize = 2;
const USERNAME_MAX_LEN: usize = 20;

/// Enforces the 2-20 character username bound. Character count, not byte
/// count, so multi-byte usernames aren't penalized.
pub fn validate_username(username: &str) -> CoreResult<()> {
    let len = username.chars().count();
    if (USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        Ok(())
    } else {
        Err(CoreError::validation(format!(
            "Username must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} characters."
        )))
    }
}

/// A point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Drawing primitive variant. A stroke with `tool == Eraser` is logged as an
/// `erase` operation; every other tool is logged as `draw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Brush,
    Eraser,
    Rectangle,
    Circle,
    Line,
    Text,
}

impl Tool {
    pub fn operation_type(self) -> OperationType {
        if self == Tool::Eraser {
            OperationType::Erase
        } else {
            OperationType::Draw
        }
    }
}

/// An opaque drawing primitive. `points` only ever grows while the stroke is
/// active; once `stroke:end` finalizes it, it is treated as immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: String,
    pub user_id: String,
    pub tool: Tool,
    pub color: String,
    pub width: f64,
    pub points: Vec<Point>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A connected participant of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub color: String,
    pub cursor_position: Option<Point>,
    pub is_drawing: bool,
}

impl User {
    pub fn new(id: String, username: String, color: String) -> Self {
        Self {
            id,
            username,
            color,
            cursor_position: None,
            is_drawing: false,
        }
    }
}

/// Whether a logged operation added or removed a stroke from view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Draw,
    Erase,
}

/// An append-only log entry describing one completed mutation. `stroke`
/// holds a deep copy of the stroke as it existed when the operation
/// completed, so both undo-of-erase and redo-of-draw can restore it without
/// walking the rest of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub stroke_id: String,
    pub stroke: Stroke,
    pub user_id: String,
    pub timestamp: i64,
}

/// Fixed, ordered color palette assigned round-robin on join. Must stay
/// stable across restarts so reconnecting clients keep familiar identities.
pub const USER_COLORS: &[&str] = &[
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
];

pub fn palette_color(index: usize) -> &'static str {
    USER_COLORS[index % USER_COLORS.len()]
}

/// `{ operationCount, undoneCount }`, used by clients to drive undo/redo
/// button enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryState {
    pub operation_count: usize,
    pub undone_count: usize,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
