//! Real-time event types and broadcast logic for the MebelPlace marketplace.
//!
//! This crate defines the rooms connections can join, the domain events the
//! order and chat flows publish, the notifications that go out over the wire,
//! and the routing table mapping each event to the rooms that must receive it.
//! Delivery itself is abstracted behind [`WebsocketSender`], with
//! [`PushFallback`] as the channel of last resort for users who are offline.
//!
//! # Main Components
//!
//! * [`Room`] - typed room names (`user:{id}`, `order:{id}`, `chat:{id}`, `broadcast`)
//! * [`rooms_for`] - the event-to-room routing table
//! * [`broadcast_event`] - fans an event out to its rooms, with push fallback
//! * [`models`] - inbound control messages, domain events, outbound notifications
//!
//! # Example
//!
//! ```rust
//! use mebelplace_ws::models::{DomainEvent, OrderAccepted};
//! use mebelplace_ws::{Room, rooms_for};
//!
//! let event = DomainEvent::OrderAccepted(OrderAccepted {
//!     order_id: 42,
//!     master_id: 7,
//!     client_id: 3,
//! });
//!
//! assert_eq!(
//!     rooms_for(&event),
//!     [Room::Order(42), Room::User(7), Room::User(3)].into()
//! );
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod models;

mod rooms;
mod router;
mod ws;

pub use rooms::*;
pub use router::*;
pub use ws::*;
