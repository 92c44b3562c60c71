use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// A named interest group of connections.
///
/// Rooms are the unit of targeting for every broadcast. A connection can be a
/// member of any number of rooms at once, and membership is tracked by the
/// connection registry rather than by the room itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Room {
    /// Personal notifications for a single user, across all of their
    /// simultaneous connections.
    User(u64),
    /// Everyone watching a single order.
    Order(u64),
    /// Participants of a single conversation.
    Chat(u64),
    /// Every connected client.
    Broadcast,
}

impl Room {
    /// Returns the user ID if this is a personal room.
    #[must_use]
    pub const fn user_id(self) -> Option<u64> {
        match self {
            Self::User(id) => Some(id),
            Self::Order(..) | Self::Chat(..) | Self::Broadcast => None,
        }
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Order(id) => write!(f, "order:{id}"),
            Self::Chat(id) => write!(f, "chat:{id}"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseRoomError {
    #[error("Invalid room '{0}'")]
    Invalid(String),
    #[error("Invalid room id in '{0}'")]
    InvalidId(String),
}

impl FromStr for Room {
    type Err = ParseRoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "broadcast" {
            return Ok(Self::Broadcast);
        }

        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ParseRoomError::Invalid(s.to_owned()))?;

        let id = id
            .parse::<u64>()
            .map_err(|_| ParseRoomError::InvalidId(s.to_owned()))?;

        match kind {
            "user" => Ok(Self::User(id)),
            "order" => Ok(Self::Order(id)),
            "chat" => Ok(Self::Chat(id)),
            _ => Err(ParseRoomError::Invalid(s.to_owned())),
        }
    }
}

impl Serialize for Room {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Room {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
