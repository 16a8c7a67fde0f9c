//! Broadcast Router: per-connection session state and event dispatch (§4.4).
//!
//! The Router is the only place that trusts transport-supplied identity.
//! `current_user_id` is the session id itself, so any event field claiming
//! a different user id is a forgery attempt and is dropped, not trusted.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::mpsc::UnboundedSender;

use crate::model::{validate_username, Point};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::Registry;
use crate::room::Room;
use crate::throttle::CursorThrottle;

/// One payload submission to a session's cursor throttle. Carries its own
/// room handle because a session may switch rooms between cursor events,
/// and the trailing-edge timer must fan out into whichever room the cursor
/// event actually belonged to.
#[derive(Clone)]
struct CursorPayload {
    room: Arc<Room>,
    session_id: String,
    position: Option<Point>,
    is_drawing: bool,
}

fn cursor_emit(payload: CursorPayload) {
    tokio::spawn(async move {
        payload
            .room
            .broadcast_except(
                &payload.session_id,
                ServerEvent::CursorUpdate {
                    user_id: payload.session_id.clone(),
                    position: payload.position,
                    is_drawing: payload.is_drawing,
                },
            )
            .await;
    });
}

pub struct Session {
    id: String,
    registry: Arc<Registry>,
    outbox: UnboundedSender<ServerEvent>,
    current_room: Option<Arc<Room>>,
    current_room_id: Option<String>,
    throttle: CursorThrottle<CursorPayload>,
}

impl Session {
    pub fn new(
        id: String,
        registry: Arc<Registry>,
        outbox: UnboundedSender<ServerEvent>,
        cursor_interval: Duration,
    ) -> Self {
        Self {
            id,
            registry,
            outbox,
            current_room: None,
            current_room_id: None,
            throttle: CursorThrottle::new(cursor_interval, cursor_emit),
        }
    }

    fn reply(&self, event: ServerEvent) {
        let _ = self.outbox.send(event);
    }

    fn reply_error(&self, message: impl Into<String>) {
        self.reply(ServerEvent::Error {
            message: message.into(),
        });
    }

    fn current_user_id(&self) -> &str {
        &self.id
    }

    /// Dispatches one decoded client event. Never returns an error to the
    /// caller: every failure mode here resolves to either an `error` reply
    /// to the origin or a silent drop, per the error-handling policy.
    pub async fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::RoomJoin { room_id, username } => {
                self.join(room_id, username).await;
            }
            ClientEvent::RoomLeave { room_id } => {
                self.leave(&room_id).await;
            }
            ClientEvent::CursorMove {
                room_id,
                position,
                is_drawing,
            } => {
                self.cursor_move(&room_id, position, is_drawing).await;
            }
            ClientEvent::StrokeStart { stroke, room_id } => {
                self.stroke_start(stroke, &room_id).await;
            }
            ClientEvent::StrokePoint {
                stroke_id,
                point,
                room_id,
            } => {
                self.stroke_point(&stroke_id, point, &room_id).await;
            }
            ClientEvent::StrokeEnd { stroke_id, room_id } => {
                self.stroke_end(&stroke_id, &room_id).await;
            }
            ClientEvent::CanvasClear { room_id } => {
                self.canvas_clear(&room_id).await;
            }
            ClientEvent::OperationUndo { room_id } => {
                self.undo(&room_id).await;
            }
            ClientEvent::OperationRedo { room_id } => {
                self.redo(&room_id).await;
            }
            ClientEvent::Ping => {
                self.reply(ServerEvent::Pong {
                    timestamp: crate::model::now_ms(),
                });
            }
        }
    }

    /// Returns the current room only if `room_id` matches the session's
    /// current room, per "requires authenticated session and matching
    /// code" — the shared guard for every in-room event.
    fn authenticated_room(&self, room_id: &str) -> Option<Arc<Room>> {
        if self.current_room_id.as_deref() == Some(room_id) {
            self.current_room.clone()
        } else {
            None
        }
    }

    async fn join(&mut self, room_id: String, username: String) {
        if !crate::registry::is_valid_room_code(&room_id) {
            self.reply_error("Invalid room code. Must be exactly 6 alphanumeric characters.");
            return;
        }
        if let Err(err) = validate_username(&username) {
            self.reply_error(err.client_message().unwrap_or_default());
            return;
        }

        if self.current_room_id.is_some() {
            self.leave_current().await;
        }

        let room = match self.registry.get_or_create(&room_id).await {
            Ok(room) => room,
            Err(err) => {
                self.reply_error(err.client_message().unwrap_or_default());
                return;
            }
        };

        self.registry.cancel_cleanup(&room_id);
        room.register_peer(self.id.clone(), self.outbox.clone()).await;

        let restored = room.restored_from_disk().await;
        let stroke_count = room.stroke_count().await;
        let user = room.add_user(self.id.clone(), username.clone()).await;

        self.current_room = Some(room.clone());
        self.current_room_id = Some(room_id.clone());

        self.reply(ServerEvent::RoomJoined {
            room_id: room_id.clone(),
            user_id: user.id.clone(),
            username: user.username.clone(),
            color: user.color.clone(),
        });
        self.reply(ServerEvent::UserList {
            users: room.list_users().await,
        });
        self.reply(ServerEvent::CanvasState {
            strokes: room.get_strokes().await,
        });
        if restored && stroke_count > 0 {
            self.reply(ServerEvent::CanvasRestored { stroke_count });
        }
        let history = room.history_state().await;
        self.reply(ServerEvent::HistoryState {
            operation_count: history.operation_count,
            undone_count: history.undone_count,
        });

        room.broadcast_except(&self.id, ServerEvent::UserJoined { user }).await;
    }

    async fn leave(&mut self, room_id: &str) {
        if self.authenticated_room(room_id).is_none() {
            return;
        }
        self.leave_current().await;
    }

    /// Shared teardown for explicit leave and room-switch-on-rejoin.
    async fn leave_current(&mut self) {
        let (Some(room), Some(room_id)) = (self.current_room.take(), self.current_room_id.take())
        else {
            return;
        };

        let now_empty = room.remove_user(&self.id).await;
        room.remove_peer(&self.id).await;
        room.broadcast_except(&self.id, ServerEvent::UserLeft {
            user_id: self.id.clone(),
        })
        .await;

        if now_empty {
            self.registry.schedule_cleanup(&room_id);
        }
    }

    async fn cursor_move(&mut self, room_id: &str, position: Option<Point>, is_drawing: bool) {
        let Some(room) = self.authenticated_room(room_id) else {
            return;
        };
        room.update_cursor(&self.id, position, is_drawing).await;
        self.throttle.submit(CursorPayload {
            room,
            session_id: self.id.clone(),
            position,
            is_drawing,
        });
    }

    async fn stroke_start(&mut self, stroke: crate::model::Stroke, room_id: &str) {
        let Some(room) = self.authenticated_room(room_id) else {
            return;
        };
        if stroke.user_id != self.current_user_id() {
            warn!(
                "session {} attempted stroke:start with spoofed userId {}",
                self.id, stroke.user_id
            );
            return;
        }

        if room.add_stroke(stroke.clone()).await {
            warn!(
                "session {} sent stroke:start with a colliding stroke id {}",
                self.id, stroke.id
            );
            return;
        }
        room.broadcast_except(
            &self.id,
            ServerEvent::StrokeStart {
                stroke,
                room_id: room_id.to_string(),
            },
        )
        .await;
        self.schedule_persist(&room, room_id).await;
    }

    async fn stroke_point(&mut self, stroke_id: &str, point: Point, room_id: &str) {
        let Some(room) = self.authenticated_room(room_id) else {
            return;
        };
        let Some(stroke) = room.get_stroke(stroke_id).await else {
            return;
        };
        if stroke.user_id != self.current_user_id() {
            warn!(
                "session {} attempted stroke:point on stroke {} owned by {}",
                self.id, stroke_id, stroke.user_id
            );
            return;
        }

        if !room.update_stroke(stroke_id, point).await {
            return;
        }
        room.broadcast_except(
            &self.id,
            ServerEvent::StrokePoint {
                stroke_id: stroke_id.to_string(),
                point,
                room_id: room_id.to_string(),
            },
        )
        .await;
    }

    async fn stroke_end(&mut self, stroke_id: &str, room_id: &str) {
        let Some(room) = self.authenticated_room(room_id) else {
            return;
        };
        let Some(stroke) = room.get_stroke(stroke_id).await else {
            return;
        };
        if stroke.user_id != self.current_user_id() {
            warn!(
                "session {} attempted stroke:end on stroke {} owned by {}",
                self.id, stroke_id, stroke.user_id
            );
            return;
        }

        room.finalize_stroke(stroke_id).await;
        room.broadcast_except(
            &self.id,
            ServerEvent::StrokeEnd {
                stroke_id: stroke_id.to_string(),
                room_id: room_id.to_string(),
            },
        )
        .await;
        self.broadcast_history(&room).await;
        self.schedule_persist(&room, room_id).await;
    }

    async fn canvas_clear(&mut self, room_id: &str) {
        let Some(room) = self.authenticated_room(room_id) else {
            return;
        };
        room.clear().await;
        room.broadcast_all(ServerEvent::CanvasClear).await;
        self.broadcast_history(&room).await;
        self.schedule_persist(&room, room_id).await;
    }

    async fn undo(&mut self, room_id: &str) {
        let Some(room) = self.authenticated_room(room_id) else {
            return;
        };
        let Some(op) = room.undo().await else {
            return;
        };
        room.broadcast_all(ServerEvent::OperationUndo(op)).await;
        self.broadcast_history(&room).await;
        self.schedule_persist(&room, room_id).await;
    }

    async fn redo(&mut self, room_id: &str) {
        let Some(room) = self.authenticated_room(room_id) else {
            return;
        };
        let Some(op) = room.redo().await else {
            return;
        };
        room.broadcast_all(ServerEvent::OperationRedo(op)).await;
        self.broadcast_history(&room).await;
        self.schedule_persist(&room, room_id).await;
    }

    async fn broadcast_history(&self, room: &Arc<Room>) {
        let history = room.history_state().await;
        room.broadcast_all(ServerEvent::HistoryState {
            operation_count: history.operation_count,
            undone_count: history.undone_count,
        })
        .await;
    }

    async fn schedule_persist(&self, room: &Arc<Room>, room_id: &str) {
        if let Some(snapshot) = room.dirty_snapshot().await {
            self.registry.persistence().schedule_write(room_id, snapshot);
        }
    }

    /// Called when the transport connection drops, abruptly or otherwise.
    pub async fn disconnect(&mut self) {
        self.leave_current().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stroke, Tool};
    use crate::persistence::PersistenceLayer;
    use tokio::sync::mpsc;

    fn registry() -> Arc<Registry> {
        let tmp = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceLayer::new(tmp.path().to_path_buf()));
        Registry::new(persistence, Duration::from_secs(60))
    }

    fn session(id: &str, registry: Arc<Registry>) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Session::new(id.to_string(), registry, tx, Duration::from_millis(35)),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn join_sends_handshake_to_origin_only() {
        let registry = registry();
        let (mut alice, mut alice_rx) = session("alice", registry.clone());

        alice
            .handle(ClientEvent::RoomJoin {
                room_id: "ABC123".to_string(),
                username: "alice".to_string(),
            })
            .await;

        let events = drain(&mut alice_rx);
        assert!(matches!(events[0], ServerEvent::RoomJoined { .. }));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::UserList { .. })));
        assert!(events.iter().any(|e| matches!(e, ServerEvent::CanvasState { .. })));
    }

    #[tokio::test]
    async fn second_joiner_is_announced_to_the_first_but_not_to_itself() {
        let registry = registry();
        let (mut alice, mut alice_rx) = session("alice", registry.clone());
        let (mut bob, mut bob_rx) = session("bob", registry.clone());

        alice
            .handle(ClientEvent::RoomJoin {
                room_id: "ABC123".to_string(),
                username: "alice".to_string(),
            })
            .await;
        drain(&mut alice_rx);

        bob.handle(ClientEvent::RoomJoin {
            room_id: "ABC123".to_string(),
            username: "bob".to_string(),
        })
        .await;

        let alice_events = drain(&mut alice_rx);
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserJoined { .. })));

        let bob_events = drain(&mut bob_rx);
        assert!(!bob_events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserJoined { .. })));
    }

    #[tokio::test]
    async fn invalid_room_code_yields_error_and_no_join() {
        let registry = registry();
        let (mut alice, mut alice_rx) = session("alice", registry);

        alice
            .handle(ClientEvent::RoomJoin {
                room_id: "abc123".to_string(),
                username: "alice".to_string(),
            })
            .await;

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn stroke_start_with_spoofed_user_id_is_dropped() {
        let registry = registry();
        let (mut alice, mut alice_rx) = session("alice", registry.clone());
        alice
            .handle(ClientEvent::RoomJoin {
                room_id: "ABC123".to_string(),
                username: "alice".to_string(),
            })
            .await;
        drain(&mut alice_rx);

        let stroke = Stroke {
            id: "s1".to_string(),
            user_id: "someone-else".to_string(),
            tool: Tool::Brush,
            color: "#000".to_string(),
            width: 2.0,
            points: vec![],
            timestamp: 1,
            text: None,
        };
        alice
            .handle(ClientEvent::StrokeStart {
                stroke,
                room_id: "ABC123".to_string(),
            })
            .await;

        let room = registry.get("ABC123").unwrap();
        assert_eq!(room.stroke_count().await, 0);
    }

    #[tokio::test]
    async fn stroke_end_broadcasts_history_to_the_whole_room_including_origin() {
        let registry = registry();
        let (mut alice, mut alice_rx) = session("alice", registry.clone());
        alice
            .handle(ClientEvent::RoomJoin {
                room_id: "ABC123".to_string(),
                username: "alice".to_string(),
            })
            .await;
        drain(&mut alice_rx);

        let stroke = Stroke {
            id: "s1".to_string(),
            user_id: "alice".to_string(),
            tool: Tool::Brush,
            color: "#000".to_string(),
            width: 2.0,
            points: vec![],
            timestamp: 1,
            text: None,
        };
        alice
            .handle(ClientEvent::StrokeStart {
                stroke,
                room_id: "ABC123".to_string(),
            })
            .await;
        drain(&mut alice_rx);

        alice
            .handle(ClientEvent::StrokeEnd {
                stroke_id: "s1".to_string(),
                room_id: "ABC123".to_string(),
            })
            .await;

        let events = drain(&mut alice_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::HistoryState { operation_count: 1, .. })));
    }

    #[tokio::test]
    async fn leave_removes_user_and_notifies_remaining_peers() {
        let registry = registry();
        let (mut alice, mut alice_rx) = session("alice", registry.clone());
        let (mut bob, mut bob_rx) = session("bob", registry.clone());

        alice
            .handle(ClientEvent::RoomJoin {
                room_id: "ABC123".to_string(),
                username: "alice".to_string(),
            })
            .await;
        drain(&mut alice_rx);
        bob.handle(ClientEvent::RoomJoin {
            room_id: "ABC123".to_string(),
            username: "bob".to_string(),
        })
        .await;
        drain(&mut bob_rx);

        alice
            .handle(ClientEvent::RoomLeave {
                room_id: "ABC123".to_string(),
            })
            .await;

        let bob_events = drain(&mut bob_rx);
        assert!(bob_events
            .iter()
            .any(|e| matches!(e, ServerEvent::UserLeft { user_id } if user_id == "alice")));
    }

    #[tokio::test]
    async fn ping_replies_with_pong_immediately() {
        let registry = registry();
        let (mut alice, mut alice_rx) = session("alice", registry);

        alice.handle(ClientEvent::Ping).await;

        let events = drain(&mut alice_rx);
        assert!(matches!(events[0], ServerEvent::Pong { .. }));
    }
}
