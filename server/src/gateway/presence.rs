//! Presence set and focus map.
//!
//! DESIGN
//! ======
//! Membership is keyed by user, not by connection: a user with two tabs
//! appears once. The tracker itself never decides whether a disconnect is
//! the user's last — the gateway recomputes that from the live-connection
//! set and only then calls [`PresenceTracker::exit`].
//!
//! Focus records are per-user, last-writer-wins, and removed when the user
//! goes fully offline. Every mutation of either map dispatches the matching
//! synthetic event so subscribed clients converge.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use uuid::Uuid;

use crate::bus::{Bus, ChangeEvent};
use messages::{FocusRecord, PresenceSnapshot};

#[derive(Default)]
struct PresenceState {
    online: BTreeSet<Uuid>,
    focus: BTreeMap<Uuid, FocusRecord>,
}

pub struct PresenceTracker {
    bus: Bus,
    state: Mutex<PresenceState>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(bus: Bus) -> Self {
        Self { bus, state: Mutex::new(PresenceState::default()) }
    }

    /// Mark a user online. Dispatches `status` only on a fresh entry, so a
    /// second tab is silent.
    pub fn enter(&self, user: Uuid) {
        let newly_online = {
            let mut state = self.state.lock().expect("presence state poisoned");
            state.online.insert(user)
        };
        if newly_online {
            self.bus.publish(ChangeEvent::Status);
        }
    }

    /// Mark a user offline and drop their focus record. The caller has
    /// already established that no other live connection carries the user.
    pub fn exit(&self, user: Uuid) {
        let (was_online, removed_focus) = {
            let mut state = self.state.lock().expect("presence state poisoned");
            (state.online.remove(&user), state.focus.remove(&user))
        };
        if was_online {
            self.bus.publish(ChangeEvent::Status);
        }
        if let Some(record) = removed_focus {
            self.bus.publish(ChangeEvent::Focus { collection: record.collection });
        }
    }

    /// Record what a user is looking at. Overwrites any prior record and
    /// dispatches `focus` on the affected collection — both of them when
    /// the user moved between collections.
    pub fn set_focus(&self, user: Uuid, record: FocusRecord) {
        let prior = {
            let mut state = self.state.lock().expect("presence state poisoned");
            state.focus.insert(user, record.clone())
        };
        self.bus.publish(ChangeEvent::Focus { collection: record.collection.clone() });
        if let Some(prior) = prior {
            if prior.collection != record.collection {
                self.bus.publish(ChangeEvent::Focus { collection: prior.collection });
            }
        }
    }

    #[must_use]
    pub fn is_online(&self, user: Uuid) -> bool {
        self.state.lock().expect("presence state poisoned").online.contains(&user)
    }

    #[must_use]
    pub fn focus_of(&self, user: Uuid) -> Option<FocusRecord> {
        self.state.lock().expect("presence state poisoned").focus.get(&user).cloned()
    }

    /// Snapshot for the `status` side channel on subscription frames.
    #[must_use]
    pub fn snapshot(&self) -> PresenceSnapshot {
        let state = self.state.lock().expect("presence state poisoned");
        PresenceSnapshot {
            online: state.online.iter().copied().collect(),
            focus: state.focus.clone(),
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
