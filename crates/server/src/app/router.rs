use crate::app::AppState;
use crate::error::ApiError;
use crate::push;
use sotto_proto::{ClientFrame, DeliveryState, StatusFrame, error_frame, error_status_frame};
use sotto_storage::{NewMessageStatus, NewPendingMessage, StoreError, UserRecord};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consumes one inbound frame from an authenticated live connection.
///
/// Malformed frames are answered in-band and never tear the connection down;
/// an `Err` here means a store/infrastructure failure the caller should
/// report back (also in-band) with the generic message.
pub async fn handle_frame(
    state: &Arc<AppState>,
    sender: &UserRecord,
    raw: &[u8],
    outbound: &mpsc::Sender<String>,
) -> Result<(), ApiError> {
    let frame = match ClientFrame::decode(raw) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(user = %sender.name, "dropping malformed frame: {}", error);
            let _ = outbound.send(error_frame("Invalid message payload")).await;
            return Ok(());
        }
    };
    state.metrics.mark_ingress();
    match frame.state {
        Some(update) => route_status_update(state, sender, &frame, update).await,
        None => route_new_message(state, sender, &frame, outbound).await,
    }
}

/// New message: acknowledge SENT, then branch on receiver presence. Live
/// delivery skips the store entirely; offline delivery persists the message
/// plus its status row and pokes the push lane.
async fn route_new_message(
    state: &Arc<AppState>,
    sender: &UserRecord,
    frame: &ClientFrame,
    outbound: &mpsc::Sender<String>,
) -> Result<(), ApiError> {
    let _ = outbound
        .send(StatusFrame::new(&frame.id, DeliveryState::Sent).encode())
        .await;

    let receiver = match state.store.find_user_by_name(&frame.receiver).await {
        Ok(receiver) => receiver,
        Err(StoreError::Missing) => {
            debug!(user = %sender.name, receiver = %frame.receiver, "receiver not found");
            let reason = ApiError::ReceiverNotFound.public_message();
            let _ = outbound
                .send(error_status_frame(&frame.id, &reason))
                .await;
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    if let Some(handle) = state.presence.lookup(&receiver.user_id).await {
        let payload = frame.delivery_payload(&sender.name).to_string();
        if handle.send(payload).await.is_ok() {
            state.metrics.mark_egress();
            let _ = outbound
                .send(StatusFrame::new(&frame.id, DeliveryState::Delivered).encode())
                .await;
            info!(from = %sender.name, to = %receiver.name, id = %frame.id, "delivered live");
            return Ok(());
        }
        // Stale handle: the receiver's pump is gone but the registry entry
        // lingered. Fall through to store-and-forward.
        debug!(to = %receiver.name, "live handle closed, storing instead");
    }

    store_and_forward(state, sender, &receiver, frame, outbound).await
}

async fn store_and_forward(
    state: &Arc<AppState>,
    sender: &UserRecord,
    receiver: &UserRecord,
    frame: &ClientFrame,
    outbound: &mpsc::Sender<String>,
) -> Result<(), ApiError> {
    state
        .store
        .create_pending_message(&NewPendingMessage {
            message_id: frame.id.clone(),
            content: frame.content.clone(),
            sender_id: sender.user_id.clone(),
            receiver_id: receiver.user_id.clone(),
        })
        .await?;
    state
        .store
        .create_message_status(&NewMessageStatus {
            message_id: frame.id.clone(),
            state: DeliveryState::Received.as_str().to_string(),
            sender_id: sender.user_id.clone(),
        })
        .await?;
    state.metrics.mark_stored();
    let _ = outbound
        .send(StatusFrame::new(&frame.id, DeliveryState::Received).encode())
        .await;
    info!(from = %sender.name, to = %receiver.name, id = %frame.id, "stored for later delivery");
    if let Some(device_token) = receiver.notification_token.clone() {
        push::dispatch(
            Arc::clone(&state.push),
            Arc::clone(&state.metrics),
            device_token,
            sender.name.clone(),
        );
    }
    Ok(())
}

/// Status update: route the observation to the party that should see it,
/// live when possible, persisted otherwise.
async fn route_status_update(
    state: &Arc<AppState>,
    sender: &UserRecord,
    frame: &ClientFrame,
    update: DeliveryState,
) -> Result<(), ApiError> {
    let observer = match state.store.find_user_by_name(&frame.receiver).await {
        Ok(observer) => observer,
        Err(StoreError::Missing) => {
            warn!(user = %sender.name, observer = %frame.receiver, "status update for unknown party");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };
    if let Some(handle) = state.presence.lookup(&observer.user_id).await {
        let notification = StatusFrame::new(&frame.id, update).encode();
        if handle.send(notification).await.is_ok() {
            state.metrics.mark_egress();
            debug!(from = %sender.name, to = %observer.name, id = %frame.id, state = %update, "status forwarded");
            return Ok(());
        }
    }
    state
        .store
        .create_message_status(&NewMessageStatus {
            message_id: frame.id.clone(),
            state: update.as_str().to_string(),
            sender_id: observer.user_id.clone(),
        })
        .await?;
    debug!(from = %sender.name, to = %observer.name, id = %frame.id, state = %update, "status persisted");
    Ok(())
}
