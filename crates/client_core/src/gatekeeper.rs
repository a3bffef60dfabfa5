use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use shared::{
    domain::{RoomId, RoomKey},
    error::DenyReason,
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionEvent, ConnectionManager, ConnectionState},
    rest::MembershipApi,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Unknown,
    Checking,
    Granted,
    Denied(DenyReason),
}

/// The observable state of one room subscription.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomSubscription {
    pub room: RoomKey,
    pub access: AccessState,
    /// Whether the join event has been delivered on the current link.
    pub joined: bool,
}

/// Per-room access state machine: `Unknown -> Checking -> Granted/Denied`,
/// teardown back to `Unknown`. A join is attempted at most once per
/// subscription lifetime; re-requesting a room that is already `Checking`
/// or `Granted` is a no-op. After a reconnect the gatekeeper re-issues
/// joins for granted rooms itself; the Connection Manager restores nothing.
pub struct RoomGatekeeper {
    connection: Arc<ConnectionManager>,
    membership: Arc<dyn MembershipApi>,
    rooms: Mutex<GatekeeperRooms>,
}

struct GatekeeperRooms {
    slots: HashMap<RoomKey, RoomSlot>,
    next_generation: u64,
}

struct RoomSlot {
    /// Stamped into in-flight work; a released or rebuilt slot carries a
    /// newer generation, so late decisions cannot resurrect it.
    generation: u64,
    tx: watch::Sender<RoomSubscription>,
    check: Option<JoinHandle<()>>,
}

impl RoomGatekeeper {
    pub fn new(connection: Arc<ConnectionManager>, membership: Arc<dyn MembershipApi>) -> Arc<Self> {
        let lifecycle = connection.lifecycle_events();
        let frames = connection.frames();
        let gatekeeper = Arc::new(Self {
            connection,
            membership,
            rooms: Mutex::new(GatekeeperRooms {
                slots: HashMap::new(),
                next_generation: 0,
            }),
        });
        tokio::spawn(run_events(Arc::downgrade(&gatekeeper), lifecycle, frames));
        gatekeeper
    }

    /// Resolve access for a room and hand back its subscription observable.
    pub async fn request_room(self: &Arc<Self>, room: RoomKey) -> watch::Receiver<RoomSubscription> {
        let mut rooms = self.rooms.lock().await;
        if let Some(slot) = rooms.slots.get(&room) {
            let access = slot.tx.borrow().access;
            if matches!(access, AccessState::Checking | AccessState::Granted) {
                debug!(%room, "room already requested; reusing subscription");
                return slot.tx.subscribe();
            }
            // A Denied or torn-down leftover: rebuild the slot below.
        }

        rooms.next_generation += 1;
        let generation = rooms.next_generation;
        let (tx, rx) = watch::channel(RoomSubscription {
            room,
            access: AccessState::Unknown,
            joined: false,
        });

        if !room.kind.is_restricted() {
            tx.send_modify(|sub| sub.access = AccessState::Granted);
            rooms.slots.insert(
                room,
                RoomSlot {
                    generation,
                    tx,
                    check: None,
                },
            );
            drop(rooms);
            info!(%room, "open room granted");
            self.try_join(room, generation).await;
            return rx;
        }

        let Some(identity) = self.connection.identity().await else {
            tx.send_modify(|sub| sub.access = AccessState::Denied(DenyReason::NotAuthenticated));
            rooms.slots.insert(
                room,
                RoomSlot {
                    generation,
                    tx,
                    check: None,
                },
            );
            warn!(%room, "restricted room requested without a bound identity");
            return rx;
        };

        tx.send_modify(|sub| sub.access = AccessState::Checking);
        rooms.slots.insert(
            room,
            RoomSlot {
                generation,
                tx,
                check: None,
            },
        );
        let gatekeeper = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let decision = gatekeeper
                .membership
                .check_membership(identity.user_id, room.room_id)
                .await;
            gatekeeper
                .apply_membership_decision(room, generation, decision)
                .await;
        });
        if let Some(slot) = rooms.slots.get_mut(&room) {
            slot.check = Some(handle);
        }
        rx
    }

    /// Drop a subscription: cancel any in-flight check, send a best-effort
    /// leave if joined, and reset observers to `Unknown`.
    pub async fn release_room(&self, room: RoomKey) {
        let leave = {
            let mut rooms = self.rooms.lock().await;
            let Some(slot) = rooms.slots.remove(&room) else {
                return;
            };
            if let Some(check) = slot.check {
                check.abort();
            }
            let was_joined = {
                let sub = slot.tx.borrow();
                sub.access == AccessState::Granted && sub.joined
            };
            slot.tx.send_modify(|sub| {
                sub.access = AccessState::Unknown;
                sub.joined = false;
            });
            was_joined
        };

        if leave {
            if let Err(err) = self
                .connection
                .send(ClientFrame::LeaveRoom {
                    room_kind: room.kind,
                    room_id: room.room_id,
                })
                .await
            {
                debug!(%room, "leave not sent: {err}");
            }
        }
        info!(%room, "room released");
    }

    pub async fn access_state(&self, room: RoomKey) -> AccessState {
        let rooms = self.rooms.lock().await;
        rooms
            .slots
            .get(&room)
            .map(|slot| slot.tx.borrow().access)
            .unwrap_or(AccessState::Unknown)
    }

    async fn apply_membership_decision(
        &self,
        room: RoomKey,
        generation: u64,
        decision: anyhow::Result<bool>,
    ) {
        let should_join = {
            let rooms = self.rooms.lock().await;
            let Some(slot) = rooms.slots.get(&room) else {
                debug!(%room, "membership decision for a released room ignored");
                return;
            };
            if slot.generation != generation {
                debug!(%room, "stale membership decision ignored");
                return;
            }
            match decision {
                Ok(true) => {
                    slot.tx.send_modify(|sub| sub.access = AccessState::Granted);
                    info!(%room, "membership confirmed");
                    true
                }
                Ok(false) => {
                    slot.tx
                        .send_modify(|sub| sub.access = AccessState::Denied(DenyReason::NotMember));
                    info!(%room, "membership denied");
                    false
                }
                Err(err) => {
                    slot.tx.send_modify(|sub| {
                        sub.access = AccessState::Denied(DenyReason::MembershipCheckFailed)
                    });
                    warn!(%room, "membership check failed: {err}");
                    false
                }
            }
        };

        if should_join {
            self.try_join(room, generation).await;
        }
    }

    /// Send the join event if the channel is up; otherwise leave `joined`
    /// false so the next `Connected`/`Reconnected` signal delivers it.
    async fn try_join(&self, room: RoomKey, generation: u64) {
        if self.connection.state() != ConnectionState::Connected {
            debug!(%room, "join deferred until the channel connects");
            return;
        }
        match self
            .connection
            .send(ClientFrame::JoinRoom {
                room_kind: room.kind,
                room_id: room.room_id,
            })
            .await
        {
            Ok(()) => {
                let rooms = self.rooms.lock().await;
                if let Some(slot) = rooms.slots.get(&room) {
                    if slot.generation == generation
                        && slot.tx.borrow().access == AccessState::Granted
                    {
                        slot.tx.send_modify(|sub| sub.joined = true);
                    }
                }
            }
            Err(err) => debug!(%room, "join not sent: {err}"),
        }
    }

    async fn handle_lifecycle(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected | ConnectionEvent::Reconnected => {
                let granted: Vec<(RoomKey, u64)> = {
                    let rooms = self.rooms.lock().await;
                    rooms
                        .slots
                        .iter()
                        .filter(|(_, slot)| slot.tx.borrow().access == AccessState::Granted)
                        .map(|(room, slot)| (*room, slot.generation))
                        .collect()
                };
                for (room, generation) in granted {
                    self.try_join(room, generation).await;
                }
            }
            ConnectionEvent::Disconnected | ConnectionEvent::ReconnectFailed => {
                self.teardown_all().await;
            }
        }
    }

    async fn teardown_all(&self) {
        let mut rooms = self.rooms.lock().await;
        if rooms.slots.is_empty() {
            return;
        }
        for (room, slot) in rooms.slots.drain() {
            if let Some(check) = slot.check {
                check.abort();
            }
            slot.tx.send_modify(|sub| {
                sub.access = AccessState::Unknown;
                sub.joined = false;
            });
            debug!(%room, "room subscription torn down with the channel");
        }
    }

    async fn apply_access_denied(&self, room_id: RoomId, code: DenyReason, message: &str) {
        let rooms = self.rooms.lock().await;
        let denied = rooms
            .slots
            .iter()
            .find(|(room, _)| room.kind.is_restricted() && room.room_id == room_id);
        if let Some((room, slot)) = denied {
            warn!(%room, %code, "server denied room access: {message}");
            slot.tx.send_modify(|sub| {
                sub.access = AccessState::Denied(code);
                sub.joined = false;
            });
        }
    }
}

async fn run_events(
    weak: Weak<RoomGatekeeper>,
    mut lifecycle: broadcast::Receiver<ConnectionEvent>,
    mut frames: broadcast::Receiver<ServerFrame>,
) {
    loop {
        tokio::select! {
            event = lifecycle.recv() => match event {
                Ok(event) => {
                    let Some(gatekeeper) = weak.upgrade() else { return };
                    gatekeeper.handle_lifecycle(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "gatekeeper lagged behind connection events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            frame = frames.recv() => match frame {
                Ok(ServerFrame::AccessDenied { room_id, code, message }) => {
                    let Some(gatekeeper) = weak.upgrade() else { return };
                    gatekeeper.apply_access_denied(room_id, code, &message).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "gatekeeper lagged behind push frames");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

#[cfg(test)]
#[path = "tests/gatekeeper_tests.rs"]
mod tests;
