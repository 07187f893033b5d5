//! Demo server: a few HTTP endpoints plus a WebSocket echo/broadcast room.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use dashmap::DashMap;
use http::StatusCode;
use serde_json::json;

use web_session::config::{load_config, ServerConfig};
use web_session::http::responses::{not_found_response, string_response};
use web_session::lifecycle::{wait_for_signal, Shutdown};
use web_session::net::tls::load_tls_acceptor;
use web_session::net::Listener;
use web_session::observability::{logging, metrics};
use web_session::{MessageKind, Request, Responder, SessionId, SessionSettings, WeakMessageSession, WebServer};

#[derive(Parser)]
#[command(name = "web-session")]
#[command(about = "HTTP/1.1 pipelining and WebSocket demo server", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

type Room = Arc<DashMap<SessionId, WeakMessageSession>>;

fn handle_request(req: Request, responder: Responder, is_secure: bool, room: &Room) {
    let response = match req.uri().path() {
        "/" => string_response(
            &req,
            "web-session demo: GET /status, or upgrade /ws\n",
            StatusCode::OK,
            "text/plain",
        ),
        "/status" => {
            let body = json!({
                "websocket_sessions": room.len(),
                "secure": is_secure,
                "version": env!("CARGO_PKG_VERSION"),
            });
            string_response(&req, &body.to_string(), StatusCode::OK, "application/json")
        }
        _ => not_found_response(&req, "Not found"),
    };
    responder.respond(response);
}

fn broadcast(room: &Room, from: SessionId, payload: bytes::Bytes, kind: MessageKind) {
    // Sending may drop the last handle of a finished session, whose close
    // callback removes from `room`; no map guard may be held at that point.
    let peers: Vec<WeakMessageSession> = room
        .iter()
        .filter(|entry| *entry.key() != from)
        .map(|entry| entry.value().clone())
        .collect();
    for peer in peers {
        let _ = peer.send(payload.clone(), kind, None);
    }
}

fn build_settings(config: &ServerConfig, room: Room) -> SessionSettings {
    let http_room = room.clone();
    let open_room = room.clone();
    let message_room = room.clone();
    let close_room = room;

    SessionSettings::from_config(&config.session)
        .on_http_request(move |req, responder, is_secure| {
            handle_request(req, responder, is_secure, &http_room)
        })
        .on_upgrade_ok(|req| req.uri().path() == "/ws")
        .on_ws_open(move |session, target, is_secure| {
            tracing::info!(session = %session.id(), target, is_secure, "WebSocket client joined");
            open_room.insert(session.id(), session);
        })
        .on_ws_message(move |session, payload, kind| {
            // Echo to the sender, then fan out to everyone else.
            let _ = session.send(payload.clone(), kind, None);
            broadcast(&message_room, session.id(), payload, kind);
        })
        .on_ws_close(move |id| {
            close_room.remove(&id);
            tracing::info!(session = %id, "WebSocket client left");
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability.log_level);
    tracing::info!("web-session v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let tls = match &config.listener.tls {
        Some(tls) => Some(load_tls_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path))?),
        None => None,
    };

    let room: Room = Arc::new(DashMap::new());
    let server = WebServer::new(build_settings(&config, room)).with_tls(tls);
    let listener = Listener::bind(&config.listener).await?;

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    let drain = config.listener.drain_timeout();
    let handle = tokio::spawn(server.run(listener, receiver, drain));

    wait_for_signal().await;
    shutdown.trigger();
    handle.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
