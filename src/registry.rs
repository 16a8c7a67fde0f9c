//! Room lookup and lifecycle (§4.1).
//!
//! Concurrent cold misses for the same room code must share a single load
//! from persistence rather than racing two constructions. This is
//! implemented with a `tokio::sync::OnceCell` per code: the first caller to
//! reach a code runs the initializer (disk load, falling back to a fresh
//! room); every other concurrent caller awaits the same `OnceCell` and
//! receives the identical `Arc<Room>`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};
use crate::persistence::PersistenceLayer;
use crate::room::Room;

/// Matches `^[A-Z0-9]{6}$` without pulling in a regex engine for a single
/// fixed-length character class check.
pub fn is_valid_room_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

struct Slot {
    once: OnceCell<Arc<Room>>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            once: OnceCell::new(),
            cleanup: Mutex::new(None),
        }
    }
}

pub struct Registry {
    rooms: Mutex<HashMap<String, Arc<Slot>>>,
    persistence: Arc<PersistenceLayer>,
    grace: std::time::Duration,
}

impl Registry {
    pub fn new(persistence: Arc<PersistenceLayer>, grace: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            persistence,
            grace,
        })
    }

    fn slot_for(&self, code: &str) -> Arc<Slot> {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Returns the canonical room for `code`, loading it from persistence
    /// or constructing a fresh one if this is the first access in the
    /// process's lifetime. Validates the code format first.
    pub async fn get_or_create(self: &Arc<Self>, code: &str) -> CoreResult<Arc<Room>> {
        if !is_valid_room_code(code) {
            return Err(CoreError::validation(
                "Invalid room code. Must be exactly 6 alphanumeric characters.",
            ));
        }

        let slot = self.slot_for(code);
        let persistence = self.persistence.clone();
        let code_owned = code.to_string();
        let room = slot
            .once
            .get_or_init(|| async move {
                match persistence.load(&code_owned).await {
                    Ok(Some(snapshot)) => Arc::new(Room::from_snapshot(
                        code_owned,
                        snapshot.strokes,
                        snapshot.operation_history,
                        snapshot.undone_operations,
                    )),
                    _ => Arc::new(Room::new(code_owned)),
                }
            })
            .await
            .clone();
        Ok(room)
    }

    /// Exposes the persistence layer so the Router can schedule writes
    /// after mutations without owning its own handle.
    pub fn persistence(&self) -> &Arc<PersistenceLayer> {
        &self.persistence
    }

    /// Looks up a room without creating it.
    pub fn get(&self, code: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.lock();
        let slot = rooms.get(code)?;
        slot.once.get().cloned()
    }

    /// Cancels any pending cleanup timer for `code`. Idempotent.
    pub fn cancel_cleanup(&self, code: &str) {
        let rooms = self.rooms.lock();
        if let Some(slot) = rooms.get(code) {
            if let Some(handle) = slot.cleanup.lock().take() {
                handle.abort();
            }
        }
    }

    /// Arms a grace-period timer that removes the room if it is still
    /// empty when the timer fires, persisting a final snapshot first.
    /// Replaces (cancels) any timer already pending for this code.
    pub fn schedule_cleanup(self: &Arc<Self>, code: &str) {
        let slot = {
            let rooms = self.rooms.lock();
            match rooms.get(code) {
                Some(slot) => slot.clone(),
                None => return,
            }
        };

        if let Some(previous) = slot.cleanup.lock().take() {
            previous.abort();
        }

        let registry = self.clone();
        let code_owned = code.to_string();
        let grace = self.grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.fire_cleanup(&code_owned).await;
        });
        *slot.cleanup.lock() = Some(handle);
    }

    async fn fire_cleanup(self: &Arc<Self>, code: &str) {
        let Some(room) = self.get(code) else {
            return;
        };
        if room.user_count().await != 0 {
            return;
        }

        let snapshot = room.snapshot().await;
        if let Err(err) = self.persistence.write_now(code, snapshot).await {
            log::error!("final save before room eviction failed for {code}: {err}");
        }

        let mut rooms = self.rooms.lock();
        rooms.remove(code);
        log::info!("room {code} evicted after grace period with no participants");
    }
}
