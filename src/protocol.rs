//! Wire contracts mapping transport events to core operations (§6).
//!
//! The envelope is `{ "type": "<event name>", "payload": <json> }`. The
//! engine.io/socket.io framing itself is the external transport library
//! named out of scope in §1; this module targets the logical event
//! contract carried over a plain WebSocket text frame.

use serde::{Deserialize, Serialize};

use crate::model::{Operation, Point, Stroke, User};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "room:join")]
    RoomJoin { room_id: String, username: String },

    #[serde(rename = "room:leave")]
    RoomLeave { room_id: String },

    #[serde(rename = "cursor:move")]
    CursorMove {
        room_id: String,
        position: Option<Point>,
        is_drawing: bool,
    },

    #[serde(rename = "stroke:start")]
    StrokeStart { stroke: Stroke, room_id: String },

    #[serde(rename = "stroke:point")]
    StrokePoint {
        stroke_id: String,
        point: Point,
        room_id: String,
    },

    #[serde(rename = "stroke:end")]
    StrokeEnd { stroke_id: String, room_id: String },

    #[serde(rename = "canvas:clear")]
    CanvasClear { room_id: String },

    #[serde(rename = "operation:undo")]
    OperationUndo { room_id: String },

    #[serde(rename = "operation:redo")]
    OperationRedo { room_id: String },

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "room:joined")]
    RoomJoined {
        room_id: String,
        user_id: String,
        username: String,
        color: String,
    },

    #[serde(rename = "user:list")]
    UserList { users: Vec<User> },

    #[serde(rename = "user:joined")]
    UserJoined { user: User },

    #[serde(rename = "user:left")]
    UserLeft { user_id: String },

    #[serde(rename = "cursor:update")]
    CursorUpdate {
        user_id: String,
        position: Option<Point>,
        is_drawing: bool,
    },

    #[serde(rename = "canvas:state")]
    CanvasState { strokes: Vec<Stroke> },

    #[serde(rename = "canvas:restored")]
    CanvasRestored { stroke_count: usize },

    #[serde(rename = "history:state")]
    HistoryState {
        operation_count: usize,
        undone_count: usize,
    },

    #[serde(rename = "stroke:start")]
    StrokeStart { stroke: Stroke, room_id: String },

    #[serde(rename = "stroke:point")]
    StrokePoint {
        stroke_id: String,
        point: Point,
        room_id: String,
    },

    #[serde(rename = "stroke:end")]
    StrokeEnd { stroke_id: String, room_id: String },

    #[serde(rename = "canvas:clear")]
    CanvasClear,

    #[serde(rename = "operation:undo")]
    OperationUndo(Operation),

    #[serde(rename = "operation:redo")]
    OperationRedo(Operation),

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    #[serde(rename = "error")]
    Error { message: String },
}
