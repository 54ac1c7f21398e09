//! Demo web server running a small script for browser clients.
//!
//! Run with: cargo run -p web-server-demo
//!
//! Then open http://localhost:3000 in your browser. Runtime options can be
//! passed as JSON in `SCRIPTVIEW_CONFIG`, e.g. `{"minCachedMessageSize": 0}`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::{Router, response::Html, routing::get};
use scriptview_core::{
    Message, RerunRequest, ScriptContext, ScriptError, ScriptFinishedStatus, ScriptRunner,
};
use scriptview_runtime::{Runtime, RuntimeConfig};
use scriptview_transport::websocket::create_ws_router;
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Greets the user and renders a table that rarely changes.
struct GreetingScript;

#[async_trait]
impl ScriptRunner for GreetingScript {
    async fn run(
        &self,
        ctx: ScriptContext,
        request: RerunRequest,
    ) -> Result<ScriptFinishedStatus, ScriptError> {
        let name = match ctx.session_state().get("name") {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => "stranger".to_string(),
        };

        ctx.enqueue(Message::delta(format!("Working on it, {name}..."), vec![0, 0]));
        tokio::select! {
            () = ctx.stopped() => return Err(ScriptError::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(300)) => {}
        }
        ctx.enqueue(Message::delta(format!("Hello, {name}!"), vec![0, 0]));

        if request.is_fragment_run() {
            return Ok(ScriptFinishedStatus::FinishedFragmentRunSuccessfully);
        }

        let table: String = (1..=500).map(|i| format!("{i}\t{}\n", i * i)).collect();
        ctx.enqueue(Message::delta(table, vec![0, 1]));
        Ok(ScriptFinishedStatus::FinishedSuccessfully)
    }
}

fn load_config() -> anyhow::Result<RuntimeConfig> {
    match std::env::var("SCRIPTVIEW_CONFIG") {
        Ok(json) => RuntimeConfig::from_json(&json).context("SCRIPTVIEW_CONFIG"),
        Err(_) => Ok(RuntimeConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    tracing::info!(?config, "loaded runtime config");

    let runtime = Arc::new(Runtime::new(config, Arc::new(GreetingScript))?);
    let (ok, outcome) = runtime.does_script_run_without_error().await;
    if !ok {
        tracing::warn!(outcome, "script check failed");
    }
    runtime.start();

    // Build router
    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_ws_router(Arc::clone(&runtime)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    runtime.stop();
    runtime.stopped().await;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>scriptview</title>
    <style>
        body { margin: 20px; font-family: system-ui, sans-serif; background: #1e1e1e; color: #d4d4d4; }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        pre { background: #111; padding: 8px; max-height: 300px; overflow: auto; }
    </style>
</head>
<body>
    <h1>scriptview</h1>
    <div class="status" id="status">Connecting...</div>
    <input id="name" placeholder="Your name" />
    <button id="rerun">Rerun</button>
    <button id="stop">Stop</button>
    <div id="slots"></div>
    <h3>Log</h3>
    <pre id="log"></pre>

    <script>
        const status = document.getElementById('status');
        const slots = document.getElementById('slots');
        const log = document.getElementById('log');
        const cache = new Map();
        let ws;
        let sessionId = null;

        function place(path, text) {
            const key = path ? path.join('.') : 'root';
            let el = document.getElementById('slot-' + key);
            if (!el) {
                el = document.createElement('pre');
                el.id = 'slot-' + key;
                slots.appendChild(el);
            }
            el.textContent = text;
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            const query = sessionId ? `?session_id=${sessionId}` : '';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws${query}`);

            ws.onopen = () => {
                status.textContent = 'Connected';
                status.className = 'status connected';
            };

            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                cache.clear();
                setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => {
                const msg = JSON.parse(event.data);
                log.textContent += msg.type + (msg.hash ? ' ' + msg.hash.slice(0, 8) : '') + '\n';
                if (msg.type === 'session_started') {
                    sessionId = msg.session_id;
                    rerun();
                } else if (msg.type === 'delta') {
                    const text = atob(msg.data);
                    if (msg.cacheable) cache.set(msg.hash, text);
                    place(msg.target_path, text);
                } else if (msg.type === 'ref_hash') {
                    place(msg.target_path, cache.get(msg.hash) ?? '[missing ' + msg.hash + ']');
                } else if (msg.type === 'exception' || msg.type === 'error') {
                    log.textContent += '  ' + msg.message + '\n';
                }
            };
        }

        function rerun() {
            const name = document.getElementById('name').value;
            ws.send(JSON.stringify({ type: 'rerun_script', widget_states: { name } }));
        }

        document.getElementById('rerun').onclick = rerun;
        document.getElementById('stop').onclick = () => ws.send(JSON.stringify({ type: 'stop_script' }));
        setInterval(() => ws && ws.readyState === WebSocket.OPEN && ws.send('{"type":"ping"}'), 15000);

        connect();
    </script>
</body>
</html>
"#;
