//! WebSocket live feed: dial `/ws`, hand every text frame to the
//! dispatcher, and reconnect through the shared state machine (fixed
//! 5-second delay, bounded attempts).

use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::conn::{ConnAction, ConnEvent, Reconnect};
use crate::dispatch::{Dispatcher, Envelope};
use crate::state::SharedState;
use crate::ui::{Transport, UiEvent, UiSender};

/// Decode one text frame and dispatch it.  A malformed payload is logged,
/// reported as a transient notice, and dropped — it never kills the feed.
pub async fn handle_frame(text: &str, dispatcher: &Mutex<Dispatcher>, ui: &UiSender) {
    match Envelope::decode(text) {
        Ok(env) => {
            if let Err(e) = dispatcher.lock().await.handle(env).await {
                warn!("dispatch failed: {e:#}");
            }
        }
        Err(e) => {
            warn!("bad feed payload: {e}");
            ui.notice("Lỗi khi xử lý dữ liệu từ server");
        }
    }
}

/// Run the feed loop.  Intended to be `tokio::spawn`-ed from main; never
/// returns.
pub async fn run(
    url: String,
    dispatcher: Arc<Mutex<Dispatcher>>,
    state: SharedState,
    ui: UiSender,
    mut fsm: Reconnect,
    wake: Arc<Notify>,
) {
    let mut was_lost = false;

    loop {
        state.write().await.feed_state = fsm.state();

        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!(%url, "feed connected");
                fsm.on_event(ConnEvent::Opened);
                state.write().await.feed_state = fsm.state();

                if was_lost {
                    was_lost = false;
                    ui.send(UiEvent::ConnectionRestored {
                        transport: Transport::Feed,
                    });
                }

                // Read until the server closes or the stream errors out.
                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(Message::Text(text)) => handle_frame(&text, &dispatcher, &ui).await,
                        Ok(Message::Close(reason)) => {
                            info!(?reason, "feed closed by server");
                            break;
                        }
                        Ok(_) => {} // ping/pong/binary — nothing for us
                        Err(e) => {
                            warn!("feed stream error: {e}");
                            break;
                        }
                    }
                }
                // Old connection is torn down here, before any new dial.
                drop(ws);
                apply(&mut fsm, ConnEvent::Closed, &state, &ui, &wake, &mut was_lost).await;
            }
            Err(e) => {
                warn!("feed connect failed: {e}");
                apply(&mut fsm, ConnEvent::Errored, &state, &ui, &wake, &mut was_lost).await;
            }
        }
    }
}

/// Honour the FSM action after a close/error: sleep out the fixed delay
/// (a wake cuts it short) or park until woken.
async fn apply(
    fsm: &mut Reconnect,
    event: ConnEvent,
    state: &SharedState,
    ui: &UiSender,
    wake: &Arc<Notify>,
    was_lost: &mut bool,
) {
    let mut action = fsm.on_event(event);
    loop {
        state.write().await.feed_state = fsm.state();
        match action {
            ConnAction::None => return,
            ConnAction::Reconnect { delay } => {
                if delay.is_zero() {
                    return;
                }
                debug!(?delay, "feed backoff");
                tokio::select! {
                    _ = sleep(delay) => return,
                    _ = wake.notified() => {
                        action = fsm.on_event(ConnEvent::Wake);
                    }
                }
            }
            ConnAction::GiveUp => {
                if !*was_lost {
                    *was_lost = true;
                    ui.send(UiEvent::ConnectionLost {
                        transport: Transport::Feed,
                    });
                }
                wake.notified().await;
                action = fsm.on_event(ConnEvent::Wake);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
