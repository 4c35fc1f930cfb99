//! Resumable event stream server.
//!
//! Run with: cargo run -p stream-resume-server -- --port 3000
//!
//! Then open http://localhost:3000 in your browser. Clients open a stream,
//! publish JSON messages to it, and on reconnect resume from the last event
//! id they saw, over either `/ws` or the SSE routes under `/streams`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
};
use clap::Parser;
use serde_json::{Value, json};
use stream_resume_core::{EventLog, EventLogConfig, config::DEFAULT_MAX_EVENTS_PER_STREAM};
use stream_resume_session::StreamSessionManager;
use stream_resume_transport::{sse::create_sse_router, websocket::create_ws_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "stream-resume-server")]
#[command(about = "Serve resumable event streams over WebSocket and SSE")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Log level used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Events retained per stream for resumption
    #[arg(long, env = "MAX_EVENTS_PER_STREAM", default_value_t = DEFAULT_MAX_EVENTS_PER_STREAM)]
    max_events_per_stream: usize,
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.to_lowercase().into()),
        )
        .init();
}

fn build_app(sessions: Arc<StreamSessionManager<Value>>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::clone(&sessions))
        .merge(create_ws_router(Arc::clone(&sessions)))
        .merge(create_sse_router(sessions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = EventLogConfig::new(args.max_events_per_stream)
        .context("invalid --max-events-per-stream")?;
    let log = Arc::new(EventLog::new(config)?);
    let sessions = Arc::new(StreamSessionManager::new(log));

    let app = build_app(sessions);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler(
    State(sessions): State<Arc<StreamSessionManager<Value>>>,
) -> impl IntoResponse {
    let stats = sessions.log().stats();
    Json(json!({
        "status": "ok",
        "active_streams": sessions.active_streams(),
        "buffered_streams": stats.streams,
        "buffered_events": stats.events,
        "max_events_per_stream": sessions.log().capacity(),
    }))
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Stream Resume</title>
    <style>
        body { margin: 0; padding: 20px; background: #1e1e1e; color: #d4d4d4; font-family: system-ui, sans-serif; }
        h1 { color: #fff; margin-bottom: 10px; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        #log { font-family: Menlo, Monaco, monospace; white-space: pre; }
    </style>
</head>
<body>
    <h1>Stream Resume</h1>
    <div class="status" id="status">Connecting...</div>
    <form id="form"><input id="input" placeholder="message" /> <button>Publish</button></form>
    <div id="log"></div>

    <script>
        const status = document.getElementById('status');
        const log = document.getElementById('log');
        let streamId;

        async function start() {
            const res = await fetch('/streams', { method: 'POST' });
            streamId = (await res.json()).stream_id;

            // EventSource resends Last-Event-ID on reconnect.
            const source = new EventSource(`/streams/${streamId}/events`);
            source.onopen = () => {
                status.textContent = `Connected to ${streamId}`;
                status.className = 'status connected';
            };
            source.onerror = () => {
                status.textContent = 'Disconnected - resuming...';
                status.className = 'status disconnected';
            };
            source.onmessage = (event) => {
                log.textContent += `${event.lastEventId}  ${event.data}\n`;
            };
        }

        document.getElementById('form').addEventListener('submit', async (e) => {
            e.preventDefault();
            const input = document.getElementById('input');
            await fetch(`/streams/${streamId}/messages`, {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({ text: input.value }),
            });
            input.value = '';
        });

        start();
    </script>
</body>
</html>
"#;
