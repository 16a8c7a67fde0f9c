//! Per-room state machine (§3, §4.2, §4.3).
//!
//! All mutable fields live behind a single `RwLock` rather than one lock per
//! field: several invariants (e.g. `addStroke` updating `strokes`,
//! `operationHistory`, and `undoneOperations` together) must be applied as
//! one indivisible step, so one combined guard is used in place of the
//! per-field locking some collaborative-editor references use.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

use crate::model::{
    now_ms, palette_color, HistoryState, Operation, OperationType, Point, Stroke, User,
};
use crate::protocol::ServerEvent;

/// Mutable state of one room, guarded as a unit.
#[derive(Default)]
struct RoomData {
    users: HashMap<String, User>,
    /// Outbound channel for each connected session, used for room-scoped
    /// fan-out. Kept alongside `users` rather than merged into it since a
    /// session can be registered slightly before its user record exists
    /// (the socket accepts before `room:join` is processed).
    peers: HashMap<String, UnboundedSender<ServerEvent>>,
    strokes: HashMap<String, Stroke>,
    operation_history: Vec<Operation>,
    undone_operations: Vec<Operation>,
    user_color_index: usize,
    /// Set when this room's state was populated from a persistence snapshot
    /// on the current process's first access, cleared never.
    restored_from_disk: bool,
    /// Bumped on every mutation; the persistence layer reads this to decide
    /// whether a write is still pending.
    dirty: bool,
}

pub struct Room {
    pub code: String,
    data: RwLock<RoomData>,
}

impl Room {
    pub fn new(code: String) -> Self {
        Self {
            code,
            data: RwLock::new(RoomData::default()),
        }
    }

    /// Constructs a room pre-populated from a loaded snapshot, marking it
    /// `restoredFromDisk`.
    pub fn from_snapshot(
        code: String,
        strokes: Vec<Stroke>,
        operation_history: Vec<Operation>,
        undone_operations: Vec<Operation>,
    ) -> Self {
        let strokes = strokes.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self {
            code,
            data: RwLock::new(RoomData {
                users: HashMap::new(),
                strokes,
                operation_history,
                undone_operations,
                user_color_index: 0,
                restored_from_disk: true,
                dirty: false,
            }),
        }
    }

    pub async fn restored_from_disk(&self) -> bool {
        self.data.read().await.restored_from_disk
    }

    // -- User operations -----------------------------------------------

    pub async fn add_user(&self, session_id: String, username: String) -> User {
        let mut data = self.data.write().await;
        let color = palette_color(data.user_color_index).to_string();
        data.user_color_index += 1;
        let user = User::new(session_id.clone(), username, color);
        data.users.insert(session_id, user.clone());
        user
    }

    /// Returns `true` when the room becomes empty as a result, so the
    /// caller can schedule cleanup.
    pub async fn remove_user(&self, session_id: &str) -> bool {
        let mut data = self.data.write().await;
        data.users.remove(session_id);
        data.users.is_empty()
    }

    pub async fn update_cursor(&self, session_id: &str, position: Option<Point>, is_drawing: bool) {
        let mut data = self.data.write().await;
        if let Some(user) = data.users.get_mut(session_id) {
            user.cursor_position = position;
            user.is_drawing = is_drawing;
        }
    }

    pub async fn list_users(&self) -> Vec<User> {
        self.data.read().await.users.values().cloned().collect()
    }

    pub async fn user_count(&self) -> usize {
        self.data.read().await.users.len()
    }

    // -- Fan-out -----------------------------------------------------------

    /// Registers a session's outbound channel for broadcast. Replaces any
    /// channel already registered under the same id.
    pub async fn register_peer(&self, session_id: String, sender: UnboundedSender<ServerEvent>) {
        self.data.write().await.peers.insert(session_id, sender);
    }

    pub async fn remove_peer(&self, session_id: &str) {
        self.data.write().await.peers.remove(session_id);
    }

    /// Sends to one session. Silently drops the event if the session has
    /// disconnected (its receiver is gone) or was never registered.
    pub async fn send_to(&self, session_id: &str, event: ServerEvent) {
        if let Some(tx) = self.data.read().await.peers.get(session_id) {
            let _ = tx.send(event);
        }
    }

    /// Sends to every registered session except `session_id`. Used for
    /// ownership-free events (cursor moves, other users' strokes) that
    /// should never echo back to their origin.
    pub async fn broadcast_except(&self, session_id: &str, event: ServerEvent) {
        let data = self.data.read().await;
        for (id, tx) in data.peers.iter() {
            if id != session_id {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Sends to every registered session, including the origin. Used for
    /// reconstructive events (canvas:clear, undo/redo) where every client,
    /// even the one that triggered it, must reapply the same state change.
    pub async fn broadcast_all(&self, event: ServerEvent) {
        let data = self.data.read().await;
        for tx in data.peers.values() {
            let _ = tx.send(event.clone());
        }
    }

    // -- Stroke operations -----------------------------------------------

    /// Stores the stroke and appends an operation for it, truncating the
    /// redo stack. A colliding stroke id (already present in the room) is
    /// an invariant violation per §3 and is rejected outright: neither the
    /// stroke nor an operation is recorded. Returns `true` if the stroke
    /// was rejected for this reason, so the caller can drop the event
    /// instead of fanning it out.
    pub async fn add_stroke(&self, stroke: Stroke) -> bool {
        let mut data = self.data.write().await;
        if data.strokes.contains_key(&stroke.id) {
            return true;
        }
        let op = Operation {
            op_type: stroke.tool.operation_type(),
            stroke_id: stroke.id.clone(),
            stroke: stroke.clone(),
            user_id: stroke.user_id.clone(),
            timestamp: now_ms(),
        };
        data.strokes.insert(stroke.id.clone(), stroke);
        data.operation_history.push(op);
        data.undone_operations.clear();
        data.dirty = true;
        false
    }

    /// Appends a point to an in-progress stroke. No-ops if the stroke is
    /// absent (it may have been concurrently undone).
    pub async fn update_stroke(&self, stroke_id: &str, point: Point) -> bool {
        let mut data = self.data.write().await;
        if let Some(stroke) = data.strokes.get_mut(stroke_id) {
            stroke.points.push(point);
            true
        } else {
            false
        }
    }

    /// Rewrites the logged operation's embedded snapshot to match the
    /// stroke's final points, so undo restores it faithfully. Truncates
    /// `undoneOperations` per §3 invariant 3: in the ordinary lifecycle
    /// `addStroke` already did this, but if a different operation was
    /// undone while this stroke was still in progress, the redo stack
    /// would otherwise survive finalize and contradict the invariant.
    pub async fn finalize_stroke(&self, stroke_id: &str) -> bool {
        let mut data = self.data.write().await;
        let Some(final_stroke) = data.strokes.get(stroke_id).cloned() else {
            return false;
        };
        if let Some(op) = data
            .operation_history
            .iter_mut()
            .rev()
            .find(|op| op.stroke_id == stroke_id)
        {
            op.stroke = final_stroke;
        }
        data.undone_operations.clear();
        data.dirty = true;
        true
    }

    pub async fn get_stroke(&self, stroke_id: &str) -> Option<Stroke> {
        self.data.read().await.strokes.get(stroke_id).cloned()
    }

    pub async fn get_strokes(&self) -> Vec<Stroke> {
        self.data.read().await.strokes.values().cloned().collect()
    }

    pub async fn stroke_count(&self) -> usize {
        self.data.read().await.strokes.len()
    }

    // -- Clear -----------------------------------------------------------

    pub async fn clear(&self) {
        let mut data = self.data.write().await;
        data.strokes.clear();
        data.operation_history.clear();
        data.undone_operations.clear();
        data.dirty = true;
    }

    // -- Undo / redo -------------------------------------------------------

    /// Pops the most recent operation, applies its inverse, and pushes it
    /// onto the redo stack. Returns `None` when there is nothing to undo.
    pub async fn undo(&self) -> Option<Operation> {
        let mut data = self.data.write().await;
        let op = data.operation_history.pop()?;
        match op.op_type {
            OperationType::Draw => {
                data.strokes.remove(&op.stroke_id);
            }
            OperationType::Erase => {
                data.strokes.insert(op.stroke_id.clone(), op.stroke.clone());
            }
        }
        data.undone_operations.push(op.clone());
        data.dirty = true;
        Some(op)
    }

    /// Pops the most recently undone operation, reapplies it, and pushes it
    /// back onto `operationHistory`. Returns `None` when there is nothing to
    /// redo.
    pub async fn redo(&self) -> Option<Operation> {
        let mut data = self.data.write().await;
        let op = data.undone_operations.pop()?;
        match op.op_type {
            OperationType::Draw => {
                data.strokes.insert(op.stroke_id.clone(), op.stroke.clone());
            }
            OperationType::Erase => {
                data.strokes.remove(&op.stroke_id);
            }
        }
        data.operation_history.push(op.clone());
        data.dirty = true;
        Some(op)
    }

    pub async fn history_state(&self) -> HistoryState {
        let data = self.data.read().await;
        HistoryState {
            operation_count: data.operation_history.len(),
            undone_count: data.undone_operations.len(),
        }
    }

    // -- Persistence support ------------------------------------------------

    /// Returns a cloneable snapshot of the persisted fields if the room has
    /// been mutated since the last call, clearing the dirty flag. Mirrors
    /// the "dirty snapshot" pattern used to avoid a lost-wakeup race between
    /// a mutation and a concurrently scheduled write.
    pub async fn dirty_snapshot(&self) -> Option<RoomSnapshot> {
        let mut data = self.data.write().await;
        if !data.dirty {
            return None;
        }
        data.dirty = false;
        Some(RoomSnapshot {
            strokes: data.strokes.values().cloned().collect(),
            operation_history: data.operation_history.clone(),
            undone_operations: data.undone_operations.clone(),
        })
    }

    /// Unconditional snapshot, used for the registry's final save when an
    /// empty room's grace period expires.
    pub async fn snapshot(&self) -> RoomSnapshot {
        let data = self.data.read().await;
        RoomSnapshot {
            strokes: data.strokes.values().cloned().collect(),
            operation_history: data.operation_history.clone(),
            undone_operations: data.undone_operations.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub strokes: Vec<Stroke>,
    pub operation_history: Vec<Operation>,
    pub undone_operations: Vec<Operation>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tool;

    fn stroke(id: &str, user: &str, tool: Tool) -> Stroke {
        Stroke {
            id: id.to_string(),
            user_id: user.to_string(),
            tool,
            color: "#000".to_string(),
            width: 3.0,
            points: vec![Point { x: 1.0, y: 1.0 }],
            timestamp: 1,
            text: None,
        }
    }

    #[tokio::test]
    async fn add_user_assigns_palette_colors_round_robin() {
        let room = Room::new("ABC123".to_string());
        let a = room.add_user("s1".to_string(), "alice".to_string()).await;
        let b = room.add_user("s2".to_string(), "bob".to_string()).await;
        assert_eq!(a.color, palette_color(0));
        assert_eq!(b.color, palette_color(1));
    }

    #[tokio::test]
    async fn add_stroke_truncates_redo_stack() {
        let room = Room::new("ABC123".to_string());
        room.add_stroke(stroke("s1", "u1", Tool::Brush)).await;
        room.undo().await;
        assert_eq!(room.history_state().await.undone_count, 1);

        room.add_stroke(stroke("s2", "u1", Tool::Brush)).await;
        assert_eq!(room.history_state().await.undone_count, 0);
    }

    #[tokio::test]
    async fn add_stroke_rejects_a_colliding_id() {
        let room = Room::new("ABC123".to_string());
        let rejected_first = room.add_stroke(stroke("s1", "u1", Tool::Brush)).await;
        assert!(!rejected_first);

        let rejected_second = room.add_stroke(stroke("s1", "u2", Tool::Brush)).await;
        assert!(rejected_second);

        let stored = room.get_stroke("s1").await.unwrap();
        assert_eq!(stored.user_id, "u1");
        assert_eq!(room.history_state().await.operation_count, 1);
    }

    #[tokio::test]
    async fn clear_truncates_redo_stack_and_resets_history() {
        let room = Room::new("ABC123".to_string());
        room.add_stroke(stroke("s1", "u1", Tool::Brush)).await;
        room.undo().await;
        room.clear().await;
        let state = room.history_state().await;
        assert_eq!(state.operation_count, 0);
        assert_eq!(state.undone_count, 0);
        assert!(room.get_strokes().await.is_empty());
    }

    #[tokio::test]
    async fn undo_then_redo_round_trips_draw() {
        let room = Room::new("ABC123".to_string());
        room.add_stroke(stroke("s1", "u1", Tool::Brush)).await;
        let strokes_before = room.get_strokes().await;

        room.undo().await;
        assert!(room.get_stroke("s1").await.is_none());

        room.redo().await;
        let strokes_after = room.get_strokes().await;
        assert_eq!(strokes_before, strokes_after);
    }

    #[tokio::test]
    async fn undoing_an_eraser_stroke_reaffirms_rather_than_hides_it() {
        // Eraser-tool strokes are stored exactly like draw strokes (the
        // wire contract has no separate remove-by-id event); only the
        // logged operation's `type` differs. Per the literal undo rule an
        // `erase` operation's inverse is "reinsert the stored snapshot",
        // which for a stroke that was never removed is an idempotent
        // no-op — see DESIGN.md for the resolved semantics.
        let room = Room::new("ABC123".to_string());
        room.add_stroke(stroke("e1", "u1", Tool::Eraser)).await;
        let op = room.undo().await.unwrap();
        assert_eq!(op.op_type, OperationType::Erase);
        assert!(room.get_stroke("e1").await.is_some());
    }

    #[tokio::test]
    async fn finalize_stroke_rewrites_operation_snapshot() {
        let room = Room::new("ABC123".to_string());
        room.add_stroke(stroke("s1", "u1", Tool::Brush)).await;
        room.update_stroke("s1", Point { x: 5.0, y: 5.0 }).await;
        room.finalize_stroke("s1").await;

        room.undo().await;
        room.redo().await;
        let restored = room.get_stroke("s1").await.unwrap();
        assert_eq!(restored.points.len(), 2);
    }

    #[tokio::test]
    async fn finalize_stroke_truncates_redo_stack_left_over_from_a_concurrent_undo() {
        let room = Room::new("ABC123".to_string());
        room.add_stroke(stroke("s1", "u1", Tool::Brush)).await;

        // A second, unrelated stroke starts, gets undone while "s1" is still
        // in progress, then "s1" finalizes.
        room.add_stroke(stroke("s2", "u1", Tool::Brush)).await;
        room.undo().await;
        assert_eq!(room.history_state().await.undone_count, 1);

        room.finalize_stroke("s1").await;
        assert_eq!(room.history_state().await.undone_count, 0);
    }

    #[tokio::test]
    async fn update_stroke_on_missing_stroke_is_noop() {
        let room = Room::new("ABC123".to_string());
        let applied = room.update_stroke("missing", Point { x: 0.0, y: 0.0 }).await;
        assert!(!applied);
    }

    #[tokio::test]
    async fn remove_user_reports_emptiness() {
        let room = Room::new("ABC123".to_string());
        room.add_user("s1".to_string(), "alice".to_string()).await;
        let now_empty = room.remove_user("s1").await;
        assert!(now_empty);
        assert_eq!(room.user_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_origin() {
        use crate::protocol::ServerEvent;
        use tokio::sync::mpsc;

        let room = Room::new("ABC123".to_string());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        room.register_peer("a".to_string(), tx_a).await;
        room.register_peer("b".to_string(), tx_b).await;

        room.broadcast_except("a", ServerEvent::CanvasClear).await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn broadcast_all_reaches_the_origin_too() {
        use crate::protocol::ServerEvent;
        use tokio::sync::mpsc;

        let room = Room::new("ABC123".to_string());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        room.register_peer("a".to_string(), tx_a).await;

        room.broadcast_all(ServerEvent::CanvasClear).await;

        assert!(rx_a.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dirty_snapshot_clears_after_read() {
        let room = Room::new("ABC123".to_string());
        assert!(room.dirty_snapshot().await.is_none());
        room.add_stroke(stroke("s1", "u1", Tool::Brush)).await;
        assert!(room.dirty_snapshot().await.is_some());
        assert!(room.dirty_snapshot().await.is_none());
    }
}
