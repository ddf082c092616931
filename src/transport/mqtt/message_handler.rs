//! Pure message routing for MQTT events
//!
//! Raw rumqttc events are classified into [`EventRoute`]s, and inbound
//! publishes are handed to the right [`MessageHandler`]: the one registered
//! for a matching subscription filter, or the session default.

use crate::protocol::messages::Message;
use crate::protocol::topics::topic_matches;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Capability invoked for every inbound message routed to it
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn on_message(&self, message: &Message) {
        self(message)
    }
}

pub type SharedHandler = Arc<dyn MessageHandler>;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK; rumqttc reports refusals as a poll error instead
    ConnectionAcknowledged,
    /// PUBLISH from the broker on a subscribed topic
    MessageReceived(Message),
    /// Final acknowledgment of a QoS 1 (PUBACK) or QoS 2 (PUBCOMP) publish
    PublishAcknowledged { packet_id: u16 },
    /// SUBACK; `granted` is false if any filter was refused
    SubscriptionConfirmed { packet_id: u16, granted: bool },
    /// Broker sent DISCONNECT
    Disconnected,
    /// Our PUBLISH left the event loop with this packet id (0 for QoS 0)
    PublishSent { packet_id: u16 },
    /// Our SUBSCRIBE left the event loop
    SubscribeSent { packet_id: u16 },
    /// Our DISCONNECT left the event loop
    DisconnectSent,
    /// Infrastructure traffic (PingResp, PubRec, ...)
    InfrastructureEvent(String),
    /// Other outgoing traffic, handled by rumqttc
    OutgoingEvent,
}

impl EventRoute {
    /// Classify a rumqttc event
    pub fn from_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: publish.qos,
                    retain: publish.retain,
                }),
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged {
                    packet_id: ack.pkid,
                },
                Packet::PubComp(comp) => EventRoute::PublishAcknowledged {
                    packet_id: comp.pkid,
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: !suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure)),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::PublishSent { packet_id: *pkid },
                Outgoing::Subscribe(pkid) => EventRoute::SubscribeSent { packet_id: *pkid },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }
}

/// Default handler plus per-filter handlers registered at subscribe time
pub struct HandlerRegistry {
    default_handler: SharedHandler,
    routes: RwLock<Vec<(String, SharedHandler)>>,
}

impl HandlerRegistry {
    pub fn new(default_handler: SharedHandler) -> Self {
        Self {
            default_handler,
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Register or replace the handler for a filter
    /// Route `filter` to `handler`, returning the handler it replaced
    pub fn add_route(&self, filter: &str, handler: SharedHandler) -> Option<SharedHandler> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = routes.iter_mut().find(|(f, _)| f == filter) {
            Some(std::mem::replace(&mut slot.1, handler))
        } else {
            routes.push((filter.to_string(), handler));
            None
        }
    }

    /// Undo an [`add_route`](Self::add_route) given the handler it returned
    pub fn restore_route(&self, filter: &str, previous: Option<SharedHandler>) {
        match previous {
            Some(handler) => {
                self.add_route(filter, handler);
            }
            None => self.remove_route(filter),
        }
    }

    pub fn remove_route(&self, filter: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(f, _)| f != filter);
    }

    /// Handler that should receive a message on `topic`
    pub fn handler_for(&self, topic: &str) -> SharedHandler {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .find(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .unwrap_or_else(|| self.default_handler.clone())
    }

    pub fn dispatch(&self, message: &Message) {
        debug!(target: "mqtt_transport", topic = %message.topic, "Dispatching inbound message");
        self.handler_for(&message.topic).on_message(message);
    }
}
