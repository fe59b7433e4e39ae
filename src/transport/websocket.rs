//! WebSocket transport
//!
//! Accepts TCP connections, performs the WebSocket upgrade on the configured
//! path and hands every upgraded connection to its own [`Session`]. Requests
//! for any other path are answered with `404 Not Found`.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;

use crate::broker::Broker;
use crate::config::BroadcastSettings;
use crate::transport::session::Session;

/// Accepts connections on `listener` until `shutdown` flips to true.
pub async fn start_websocket_server(
    listener: TcpListener,
    broker: Broker,
    settings: BroadcastSettings,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, path = %settings.path, "websocket server listening");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    broker.clone(),
                    settings.path.clone(),
                    settings.queue_size,
                    shutdown.clone(),
                ));
            }
        }
    }

    info!(%addr, "websocket server stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Broker,
    path: String,
    queue_size: usize,
    shutdown: watch::Receiver<bool>,
) {
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == path {
            return Ok(response);
        }
        let mut rejection = ErrorResponse::new(Some("not found".to_string()));
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    };

    let ws = match accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    debug!(%peer, "websocket connection upgraded");
    Session::serve(ws, broker, queue_size, shutdown).await;
    debug!(%peer, "websocket connection closed");
}
