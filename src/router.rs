//! Unicast forwarding of transfer-control and negotiation signals.
//!
//! The router only looks at the signal kind. `from` is always the
//! authenticated connection the message arrived on; the wire format has no
//! client-supplied `from` to trust in the first place.

use log::debug;

use crate::messages::{ConnectionId, ServerMessage, Signal};
use crate::registry::PeerRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// The sender never joined; nothing is forwarded on its behalf.
    UnregisteredSender,
    /// `to` is not online. Dropped without notifying the sender.
    UnknownRecipient,
    SelfAddressed,
    /// The recipient's outbox closed or overflowed; it is being disconnected.
    RecipientClosing,
}

pub fn route(
    registry: &PeerRegistry,
    from: ConnectionId,
    to: ConnectionId,
    signal: Signal,
) -> RouteOutcome {
    let kind = signal.kind();
    let Some(sender_identity) = registry.display_name(&from) else {
        debug!("Dropping {} from unregistered {}", kind, from);
        return RouteOutcome::UnregisteredSender;
    };
    if from == to {
        debug!("Dropping self-addressed {} from {}", kind, from);
        return RouteOutcome::SelfAddressed;
    }
    let Some(outbox) = registry.outbox(&to) else {
        debug!("Dropping {} from {} to unknown {}", kind, from, to);
        return RouteOutcome::UnknownRecipient;
    };

    let forwarded = ServerMessage::forward(from, sender_identity, signal);
    match outbox.push(forwarded) {
        Ok(()) => {
            debug!("Forwarded {} {} -> {}", kind, from, to);
            RouteOutcome::Delivered
        }
        Err(e) => {
            debug!("Dropping {} to {}: outbox {:?}", kind, to, e);
            RouteOutcome::RecipientClosing
        }
    }
}
