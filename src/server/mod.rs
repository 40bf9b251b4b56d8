#![forbid(unsafe_code)]

pub mod rpc;

use std::sync::Arc;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::error::{AppError, Result};
use crate::term::origin::OriginPolicy;
use crate::term::{TermMessage, TermMessageKind};

const TERMINAL_PATH_PREFIX: &str = "/ws/terminal/";

// Single WebSocket listener. Connections on /ws/terminal/<id> become
// terminal attaches; everything else speaks the JSON operation protocol.
pub async fn run(app: Arc<App>, bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| AppError::Internal(format!("failed to bind {bind}: {e}")))?;
    info!(addr = bind, "control plane listening");
    serve(app, listener).await
}

pub async fn serve(app: Arc<App>, listener: TcpListener) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            () = &mut shutdown => {
                info!("shutdown signal received, stopping control plane");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, app).await {
                        warn!(peer = %peer, "connection error: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn handle_connection(stream: TcpStream, app: Arc<App>) -> anyhow::Result<()> {
    let origin_policy = OriginPolicy::new(app.settings().terminal.allowed_origins.clone());

    // The handshake callback is the only place the request path and Origin
    // header are visible; terminal attaches are origin-gated right there.
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        path = req.uri().path().to_owned();
        if path.starts_with(TERMINAL_PATH_PREFIX) {
            let origin = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !origin.is_empty() && !origin_policy.allows(origin) {
                warn!(origin, "terminal attach rejected by origin policy");
                let mut denied = ErrorResponse::new(Some("origin not allowed".to_owned()));
                *denied.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
                return Err(denied);
            }
        }
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    if let Some(session_id) = path.strip_prefix(TERMINAL_PATH_PREFIX) {
        let session_id = session_id.to_owned();
        terminal_loop(ws, &session_id, &app).await
    } else {
        rpc_loop(ws, &app).await
    }
}

async fn rpc_loop(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    app: &App,
) -> anyhow::Result<()> {
    let (mut sink, mut stream) = ws.split();

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let response = rpc::handle(&text, app).await;
                if sink.send(Message::Text(response)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("ws error: {e}");
                break;
            }
        }
    }
    Ok(())
}

// Replay the scrollback as history frames, then interleave live output with
// client input. Closing the socket only drops the attachment; the child
// shell keeps running.
async fn terminal_loop(
    ws: tokio_tungstenite::WebSocketStream<TcpStream>,
    session_id: &str,
    app: &App,
) -> anyhow::Result<()> {
    let handle = app.terminals().attach(session_id)?;
    let crate::term::AttachHandle {
        history,
        output: mut rx,
        session,
    } = handle;

    let (mut sink, mut stream) = ws.split();

    for chunk in history {
        let frame = TermMessage {
            kind: TermMessageKind::History,
            data: chunk,
        };
        sink.send(Message::Text(serde_json::to_string(&frame)?)).await?;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<TermMessage>(&text) {
                            Ok(frame) if frame.kind == TermMessageKind::Input => {
                                if let Err(e) = session.write_input(frame.data.as_bytes()) {
                                    warn!(session = session.id(), "input write failed: {e}");
                                    break;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => debug!("ignoring malformed terminal frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("terminal ws error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            out = rx.recv() => {
                match out {
                    Ok(chunk) => {
                        let frame = TermMessage {
                            kind: TermMessageKind::Output,
                            data: chunk,
                        };
                        if sink.send(Message::Text(serde_json::to_string(&frame)?)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(session = session.id(), skipped = n, "terminal output lagged");
                    }
                }
            }
        }
    }

    info!(session = session.id(), "client detached, terminal continues");
    Ok(())
}
