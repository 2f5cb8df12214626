use super::ids::UserId;
use super::types::{DeliveryStatus, Message, SendState};

/// Visible delivery state of the local user's own messages.
///
/// Received messages and sends the backend has not confirmed resolve to `None`.
pub fn resolve(
    message: &Message,
    send_state: &SendState,
    local_user: &UserId,
) -> Option<DeliveryStatus> {
    if &message.sender_id != local_user || send_state != &SendState::Confirmed {
        return None;
    }

    let status = if message.read_at_unix_ms.is_some() {
        DeliveryStatus::Read
    } else if message.delivered_at_unix_ms.is_some() {
        DeliveryStatus::Delivered
    } else {
        DeliveryStatus::Sent
    };
    Some(status)
}
