use crate::app::{App, AppState, router};
use crate::presence::ConnectionHandle;
use crate::util::generate_id;
use futures_util::{SinkExt, StreamExt};
use sotto_auth::{AccessPolicy, Permission};
use sotto_proto::error_frame;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

const OUTBOUND_QUEUE: usize = 128;

/// Accept loop for the live-connection listener. One task per connection.
pub async fn serve(state: Arc<AppState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(error) = handle_socket(state, stream).await {
                        debug!(peer = %peer, "connection ended: {}", error);
                    }
                });
            }
            Err(error) => {
                warn!("accept failed: {}", error);
            }
        }
    }
}

async fn handle_socket(state: Arc<AppState>, stream: TcpStream) -> Result<(), WsError> {
    let mut bearer: Option<String> = None;
    let mut socket = accept_hdr_async(stream, |request: &Request, response: Response| {
        bearer = request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);
        Ok(response)
    })
    .await?;

    let app = App::new(Arc::clone(&state));
    let context = match app.authenticate(bearer.as_deref()).await {
        Ok(context) => context,
        Err(error) => {
            debug!("live connection rejected: {}", error);
            return close_policy_violation(&mut socket).await;
        }
    };
    let policy = AccessPolicy::new(&[Permission::MessagesRead]);
    if app.authorize(&context, &policy).is_err() {
        debug!(user = %context.user.name, "live connection rejected: missing scope");
        return close_policy_violation(&mut socket).await;
    }

    let user = context.user;
    let session_id = generate_id(&user.user_id);
    let (tx_out, mut rx_out) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    state
        .presence
        .connect(
            &user.user_id,
            ConnectionHandle::new(tx_out.clone(), session_id.clone()),
        )
        .await;
    state.metrics.incr_connections();
    info!(user = %user.name, session = %session_id, active = state.metrics.connections_active(), "connection open");

    let (mut sink, mut source) = socket.split();
    let pump = tokio::spawn(async move {
        while let Some(payload) = rx_out.recv().await {
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(incoming) = source.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                if let Err(error) = router::handle_frame(&state, &user, text.as_bytes(), &tx_out).await
                {
                    warn!(user = %user.name, "frame handling failed: {}", error);
                    let _ = tx_out.send(error_frame(&error.public_message())).await;
                }
            }
            Ok(Message::Binary(data)) => {
                if let Err(error) = router::handle_frame(&state, &user, &data, &tx_out).await {
                    warn!(user = %user.name, "frame handling failed: {}", error);
                    let _ = tx_out.send(error_frame(&error.public_message())).await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(user = %user.name, "read failure: {}", error);
                break;
            }
        }
    }

    state.presence.disconnect(&user.user_id, &session_id).await;
    state.metrics.decr_connections();
    info!(user = %user.name, session = %session_id, "connection closed");
    drop(tx_out);
    let _ = pump.await;
    Ok(())
}

async fn close_policy_violation(
    socket: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
) -> Result<(), WsError> {
    let outcome = socket
        .close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "User is not authenticated".into(),
        }))
        .await;
    match outcome {
        Ok(()) | Err(WsError::ConnectionClosed) => Ok(()),
        Err(error) => Err(error),
    }
}
