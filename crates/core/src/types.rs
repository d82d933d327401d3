use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventReference};

macro_rules! nid_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }

            #[must_use]
            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

nid_type!(
    /// Numeric surrogate for a room identifier.
    RoomNid
);
nid_type!(
    /// Numeric surrogate for an event type string such as `m.room.member`.
    EventTypeNid
);
nid_type!(
    /// Numeric surrogate for a state key string. Zero means "no state key".
    EventStateKeyNid
);
nid_type!(
    /// Numeric surrogate for an event id.
    EventNid
);
nid_type!(StateBlockNid);
nid_type!(
    /// Numeric surrogate for an ordered list of state blocks.
    StateSnapshotNid
);

impl EventStateKeyNid {
    /// Assigned to message events, which carry no state key.
    pub const NONE: Self = Self(0);
}

/// The (type, state key) slot an entry occupies in room state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKeyTuple {
    pub event_type_nid: EventTypeNid,
    pub event_state_key_nid: EventStateKeyNid,
}

impl StateKeyTuple {
    #[must_use]
    pub const fn new(event_type_nid: EventTypeNid, event_state_key_nid: EventStateKeyNid) -> Self {
        Self {
            event_type_nid,
            event_state_key_nid,
        }
    }
}

/// One event occupying one state slot. Orders by slot, then event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateEntry {
    pub state_key_tuple: StateKeyTuple,
    pub event_nid: EventNid,
}

impl StateEntry {
    #[must_use]
    pub const fn new(state_key_tuple: StateKeyTuple, event_nid: EventNid) -> Self {
        Self {
            state_key_tuple,
            event_nid,
        }
    }
}

/// The state before an event together with the event's own state entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateAtEvent {
    /// Zero until the state before the event has been recorded.
    pub before_state_snapshot_nid: StateSnapshotNid,
    pub state_entry: StateEntry,
}

impl StateAtEvent {
    #[must_use]
    pub const fn event_nid(&self) -> EventNid {
        self.state_entry.event_nid
    }

    /// Message events carry no state key and so do not alter room state.
    #[must_use]
    pub const fn is_state_event(&self) -> bool {
        !self.state_entry.state_key_tuple.event_state_key_nid.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateAtEventAndReference {
    pub state_at_event: StateAtEvent,
    pub event_reference: EventReference,
}

impl StateAtEventAndReference {
    #[must_use]
    pub const fn event_nid(&self) -> EventNid {
        self.state_at_event.event_nid()
    }
}

/// The blocks making up one snapshot, earliest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlockNidList {
    pub state_snapshot_nid: StateSnapshotNid,
    pub state_block_nids: Vec<StateBlockNid>,
}

/// The entries stored in one block, sorted by slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntryList {
    pub state_block_nid: StateBlockNid,
    pub state_entries: Vec<StateEntry>,
}

/// An event loaded back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_nid: EventNid,
    pub event: Event,
}

/// Key used by clients to detect resubmission of the same send request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub transaction_id: String,
    pub session_id: i64,
}

/// The membership of one user in one room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MembershipState {
    /// The row exists but no membership event has been applied yet.
    #[default]
    Unset,
    LeaveOrBan,
    Invite,
    Join,
}

impl MembershipState {
    /// Stable code persisted in the membership table.
    #[must_use]
    pub const fn code(self) -> i16 {
        match self {
            Self::Unset => 0,
            Self::LeaveOrBan => 1,
            Self::Invite => 2,
            Self::Join => 3,
        }
    }

    #[must_use]
    pub const fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Unset),
            1 => Some(Self::LeaveOrBan),
            2 => Some(Self::Invite),
            3 => Some(Self::Join),
            _ => None,
        }
    }
}

impl Display for MembershipState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unset => "unset",
            Self::LeaveOrBan => "leave",
            Self::Invite => "invite",
            Self::Join => "join",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_codes_round_trip() {
        for state in [
            MembershipState::Unset,
            MembershipState::LeaveOrBan,
            MembershipState::Invite,
            MembershipState::Join,
        ] {
            assert_eq!(MembershipState::from_code(state.code()), Some(state));
        }
        assert_eq!(MembershipState::from_code(42), None);
    }

    #[test]
    fn state_entries_sort_by_slot_then_event() {
        let name = StateKeyTuple::new(EventTypeNid(5), EventStateKeyNid(1));
        let topic = StateKeyTuple::new(EventTypeNid(6), EventStateKeyNid(1));
        let mut entries = vec![
            StateEntry::new(topic, EventNid(1)),
            StateEntry::new(name, EventNid(9)),
            StateEntry::new(name, EventNid(3)),
        ];
        entries.sort();
        assert_eq!(
            entries,
            vec![
                StateEntry::new(name, EventNid(3)),
                StateEntry::new(name, EventNid(9)),
                StateEntry::new(topic, EventNid(1)),
            ]
        );
    }

    #[test]
    fn message_events_are_not_state_events() {
        let message = StateAtEvent {
            before_state_snapshot_nid: StateSnapshotNid(0),
            state_entry: StateEntry::new(
                StateKeyTuple::new(EventTypeNid(2), EventStateKeyNid::NONE),
                EventNid(1),
            ),
        };
        assert!(!message.is_state_event());
        assert_eq!(message.event_nid(), EventNid(1));
    }

    #[test]
    fn nids_serialize_as_plain_integers() {
        let encoded = serde_json::to_string(&RoomNid(7)).expect("serialize nid");
        assert_eq!(encoded, "7");
        let decoded: EventNid = serde_json::from_str("12").expect("deserialize nid");
        assert_eq!(decoded, EventNid(12));
    }
}
