use std::collections::BTreeSet;

use crate::models::DomainEvent;
use crate::rooms::Room;

/// Computes the set of rooms that must receive `event`.
///
/// The result is a set, so a party holding several roles for the same event
/// still only appears once. Delivery happens at most once per room per
/// connection regardless of how the connection qualified.
#[must_use]
pub fn rooms_for(event: &DomainEvent) -> BTreeSet<Room> {
    match event {
        DomainEvent::NewOrder(..) | DomainEvent::UserOnline(..) | DomainEvent::UserOffline(..) => {
            BTreeSet::from([Room::Broadcast])
        }
        DomainEvent::NewOrderResponse(e) => {
            BTreeSet::from([Room::Order(e.order_id), Room::User(e.client_id)])
        }
        DomainEvent::OrderAccepted(e) => BTreeSet::from([
            Room::Order(e.order_id),
            Room::User(e.master_id),
            Room::User(e.client_id),
        ]),
        DomainEvent::OrderStatusUpdate(e) => {
            let mut rooms = BTreeSet::from([Room::Order(e.order_id), Room::User(e.client_id)]);

            if let Some(master_id) = e.master_id {
                rooms.insert(Room::User(master_id));
            }

            rooms
        }
        DomainEvent::ChatCreated(e) => {
            BTreeSet::from([Room::User(e.client_id), Room::User(e.master_id)])
        }
        DomainEvent::NewMessage(e) => BTreeSet::from([Room::Chat(e.chat_id)]),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::models::{
        ChatCreated, NewMessage, NewOrder, NewOrderResponse, OrderAccepted, OrderStatusUpdate,
        UserPresence,
    };

    #[test]
    fn test_new_order_targets_broadcast_only() {
        let event = DomainEvent::NewOrder(NewOrder {
            order: json!({"id": 42}),
        });

        assert_eq!(rooms_for(&event), BTreeSet::from([Room::Broadcast]));
    }

    #[test]
    fn test_new_order_response_targets_order_room_and_client() {
        let event = DomainEvent::NewOrderResponse(NewOrderResponse {
            order_id: 42,
            response: json!({"id": 1}),
            client_id: 3,
        });

        assert_eq!(
            rooms_for(&event),
            BTreeSet::from([Room::Order(42), Room::User(3)])
        );
    }

    #[test]
    fn test_order_accepted_targets_order_room_master_and_client() {
        let event = DomainEvent::OrderAccepted(OrderAccepted {
            order_id: 42,
            master_id: 7,
            client_id: 3,
        });

        assert_eq!(
            rooms_for(&event),
            BTreeSet::from([Room::Order(42), Room::User(7), Room::User(3)])
        );
    }

    #[test]
    fn test_order_accepted_deduplicates_when_master_is_client() {
        let event = DomainEvent::OrderAccepted(OrderAccepted {
            order_id: 42,
            master_id: 7,
            client_id: 7,
        });

        assert_eq!(
            rooms_for(&event),
            BTreeSet::from([Room::Order(42), Room::User(7)])
        );
    }

    #[test]
    fn test_order_status_update_includes_master_only_when_assigned() {
        let unassigned = DomainEvent::OrderStatusUpdate(OrderStatusUpdate {
            order_id: 42,
            status: "in_progress".to_owned(),
            updated_by: 3,
            client_id: 3,
            master_id: None,
        });

        assert_eq!(
            rooms_for(&unassigned),
            BTreeSet::from([Room::Order(42), Room::User(3)])
        );

        let assigned = DomainEvent::OrderStatusUpdate(OrderStatusUpdate {
            order_id: 42,
            status: "in_progress".to_owned(),
            updated_by: 3,
            client_id: 3,
            master_id: Some(7),
        });

        assert_eq!(
            rooms_for(&assigned),
            BTreeSet::from([Room::Order(42), Room::User(3), Room::User(7)])
        );
    }

    #[test]
    fn test_chat_created_targets_both_parties_only() {
        let event = DomainEvent::ChatCreated(ChatCreated {
            order_id: 42,
            chat_id: 5,
            client_id: 3,
            master_id: 7,
        });

        assert_eq!(
            rooms_for(&event),
            BTreeSet::from([Room::User(3), Room::User(7)])
        );
    }

    #[test]
    fn test_new_message_targets_chat_room_only() {
        let event = DomainEvent::NewMessage(NewMessage {
            chat_id: 5,
            message: json!({"content": "hello"}),
            sender_id: 7,
        });

        assert_eq!(rooms_for(&event), BTreeSet::from([Room::Chat(5)]));
    }

    #[test]
    fn test_presence_events_target_broadcast() {
        let online = DomainEvent::UserOnline(UserPresence { user_id: 7 });
        let offline = DomainEvent::UserOffline(UserPresence { user_id: 7 });

        assert_eq!(rooms_for(&online), BTreeSet::from([Room::Broadcast]));
        assert_eq!(rooms_for(&offline), BTreeSet::from([Room::Broadcast]));
    }
}
