// =============================================================================
// WebSocket hub — fan-out of pipeline events, intake of runner outputs
// =============================================================================
//
// Every subscriber (the runner and any number of UI clients) connects to
// `/ws`. Outbound traffic is the broadcast channel on AppState; inbound
// frames are runner outputs that get recorded into the UI histories and
// re-broadcast. A fresh subscriber first receives the pending post-download
// prerun event, if one is staged.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::bus::{decode_frame, BarData, BusMessage, Frame};
use crate::data_service::api::read_plot_row;
use crate::data_service::state::AppState;
use crate::ohlcv_file::OhlcvReader;

/// Axum handler for the `/ws` upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

/// Manage one subscriber connection for its lifetime.
async fn handle_socket(socket: WebSocket, app: Arc<AppState>) {
    info!("bus subscriber connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events = app.events.subscribe();

    // The pending prerun event is the first lifecycle message a fresh
    // subscriber observes.
    let pending = app.state.lock().pending_prerun_event.clone();
    if let Some(event) = pending {
        if sender.send(Message::Text(event.encode())).await.is_err() {
            info!("subscriber dropped before the pending event was delivered");
            return;
        }
        debug!("pending prerun event delivered to fresh subscriber");
    }

    loop {
        tokio::select! {
            // ── Outbound: fan out pipeline events ───────────────────────
            event = events.recv() => {
                match event {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged — events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            // ── Inbound: runner outputs and keepalives ──────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match decode_frame(&text) {
                            Frame::Messages(messages) => {
                                for message in messages {
                                    handle_inbound(&app, message);
                                }
                            }
                            Frame::Keepalive => {
                                debug!("keepalive frame received");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "subscriber receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("bus subscriber disconnected");
}

/// Process one inbound runner message.
pub fn handle_inbound(app: &Arc<AppState>, message: BusMessage) {
    match message {
        BusMessage::AckPrerunReadyAfterHistoryDownload => {
            app.clear_pending_prerun();
            debug!("pending prerun event acknowledged");
        }

        BusMessage::ScriptInfo { ref title } => {
            *app.script_title.write() = Some(title.clone());
            app.broadcast(&message);
        }

        BusMessage::ScriptModified | BusMessage::ResetHistory => {
            app.reset_histories();
            app.broadcast(&message);
        }

        BusMessage::LastBarOpenFix {
            last_bar_index: Some(index),
            ..
        } if index > 0 => {
            // Echo the re-read confirmed bar so charts repaint with the
            // repaired open.
            match OhlcvReader::open(&app.ohlcv_path)
                .and_then(|mut r| r.read(index as u64))
            {
                Ok(bar) => app.broadcast(&BusMessage::LastBarOpenFix {
                    last_bar_index: None,
                    data: Some(BarData::from_file(&bar)),
                }),
                Err(e) => warn!(index, error = %e, "failed to re-read confirmed bar"),
            }
        }
        BusMessage::LastBarOpenFix { .. } => {}

        BusMessage::TradeEntry { .. } | BusMessage::TradeClose { .. } => {
            app.push_trade_event(message.clone());
            app.broadcast(&message);
        }

        BusMessage::Plotchar { .. } => {
            app.push_plotchar_event(message.clone());
            app.broadcast(&message);
        }

        BusMessage::PlotOptions {
            data,
            confirmed_bar_index,
        } => {
            app.plot_options.write().extend(data);

            // Broadcast the confirmed bar's plot values for each series.
            if confirmed_bar_index >= 0 && app.plot_path.exists() {
                match read_plot_row(&app.plot_path, confirmed_bar_index as usize) {
                    Ok(Some((time, values))) => {
                        let titles: Vec<String> = app.plot_options.read().keys().cloned().collect();
                        for title in titles {
                            let value = values.get(&title).copied().flatten();
                            app.broadcast(&BusMessage::PlotData {
                                title,
                                time,
                                value,
                            });
                        }
                    }
                    Ok(None) => {
                        debug!(confirmed_bar_index, "plot row not yet written");
                    }
                    Err(e) => warn!(error = %e, "failed to read plot row"),
                }
            }
        }

        // Lifecycle and streaming events only ever originate here; ignore
        // echoes from misbehaving clients.
        BusMessage::PrerunReady { .. }
        | BusMessage::PrerunReadyAfterHistoryDownload { .. }
        | BusMessage::RunReady { .. }
        | BusMessage::Bar { .. }
        | BusMessage::PlotData { .. } => {}
    }
}
