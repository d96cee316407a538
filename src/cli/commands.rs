use crate::config::{CacheConfig, EngineConfig};
use crate::dispatcher::{Dispatcher, WebSocketListener};
use crate::ids::ConnectionId;
use crate::renderable::Renderable;
use crate::result::{AsyncResult, HttpResult};
use crate::router::RouteTable;
use crate::server::EngineServer;
use crate::static_files::StaticFiles;
use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Command-line interface of the sagewire engine
#[derive(Parser)]
#[command(name = "sagewire")]
#[command(about = "Embedded HTTP/WebSocket engine", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine with the demo routes
    Serve {
        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address as HOST:PORT, overriding the configuration
        #[arg(long)]
        addr: Option<String>,

        /// Directory served under /assets
        #[arg(long = "static")]
        static_dir: Option<PathBuf>,
    },
    /// Load and validate a configuration file
    Check {
        /// YAML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Execute the parsed command.
pub fn run_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve {
            config,
            addr,
            static_dir,
        } => serve(config.as_deref(), addr.as_deref(), static_dir),
        Commands::Check { config } => {
            let config = load_config(Some(&config), None)?;
            config.validate().context("Invalid configuration")?;
            println!(
                "configuration ok: bind={} http_port={:?} https_port={:?}",
                config.bind_address, config.http_port, config.https_port
            );
            Ok(())
        }
    }
}

/// Build the effective configuration: file (or defaults), `SAGE_*` variables, then `addr`.
pub fn load_config(path: Option<&Path>, addr: Option<&str>) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env();
    if let Some(addr) = addr {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("--addr must be HOST:PORT, got {addr}"))?;
        config.bind_address = host.trim_start_matches('[').trim_end_matches(']').to_string();
        config.http_port = Some(port.parse().with_context(|| format!("Invalid port in --addr {addr}"))?);
    }
    Ok(config)
}

fn serve(config: Option<&Path>, addr: Option<&str>, static_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config, addr)?;
    may::config().set_stack_size(config.stack_size);

    let routes = demo_routes(static_dir, config.cache.clone());
    info!(routes = routes.len(), "Demo routes ready");
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(routes)).with_stack_size(config.stack_size));
    dispatcher.register(Arc::new(EchoListener::new(&dispatcher)));

    let handle = EngineServer::new(config, Arc::clone(&dispatcher))
        .start()
        .context("Failed to start server")?;
    info!(
        hostname = handle.hostname(),
        http_port = ?handle.http_port(),
        https_port = ?handle.https_port(),
        "sagewire ready"
    );

    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Shutting down");
        }
        handle.stop();
        Ok(())
    }

    #[cfg(not(unix))]
    {
        handle.join().map_err(|_| anyhow!("Acceptor coroutine panicked"))
    }
}

/// Routes served by `sagewire serve`.
///
/// | Route | Behavior |
/// |-------|----------|
/// | `GET /` | plain greeting |
/// | `GET /hello?name=N` | greeting for `N` |
/// | `GET /json` | content negotiated through the JSON serializer |
/// | `POST /echo` | form fields, uploads and raw body echoed as JSON |
/// | `GET /slow?ms=N` | async result completed after `N` milliseconds |
/// | `GET /counter` | session-backed visit counter |
/// | `GET /assets/**` | files of `static_dir`, when given |
pub fn demo_routes(static_dir: Option<PathBuf>, cache: CacheConfig) -> RouteTable {
    let mut routes = RouteTable::new();
    routes
        .get("/", |_ctx| Ok(HttpResult::ok_text("sagewire is running\n").as_text()))
        .get("/hello", |ctx| {
            let name = ctx.parameter("name").unwrap_or("world");
            Ok(HttpResult::ok_text(format!("hello, {name}")).as_text())
        })
        .get("/json", |ctx| {
            Ok(HttpResult::ok().render(Renderable::object(json!({
                "engine": "sagewire",
                "path": ctx.path(),
                "request_id": ctx.request_id.to_string(),
            }))))
        })
        .post("/echo", |ctx| {
            let uploads: Vec<_> = ctx
                .uploads()
                .iter()
                .map(|u| json!({"field": u.field, "file_name": u.file_name, "size": u.size()}))
                .collect();
            let body = if ctx.form().is_empty() && uploads.is_empty() {
                Some(ctx.body_text()?)
            } else {
                None
            };
            Ok(HttpResult::ok_json(json!({
                "form": ctx.form(),
                "uploads": uploads,
                "body": body,
            })))
        })
        .get("/slow", |ctx| {
            let ms = ctx.parameter("ms").and_then(|v| v.parse().ok()).unwrap_or(100u64);
            Ok(AsyncResult::new(move |_ctx| {
                may::coroutine::sleep(Duration::from_millis(ms));
                Ok(HttpResult::ok_text(format!("slept {ms}ms")).as_text())
            })
            .with("X-Async", "true"))
        })
        .get("/counter", |ctx| {
            let visits = ctx
                .session()
                .get("visits")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            ctx.session_mut().put("visits", visits.to_string());
            Ok(HttpResult::ok_text(format!("visits: {visits}")).as_text())
        });
    if let Some(dir) = static_dir {
        info!(dir = %dir.display(), "Serving static files under /assets");
        routes.mount("/assets", Arc::new(StaticFiles::new(dir, "/assets", cache)));
    }
    routes
}

/// Sends every received WebSocket message back to the client that sent it.
pub struct EchoListener {
    dispatcher: Weak<Dispatcher>,
}

impl EchoListener {
    pub fn new(dispatcher: &Arc<Dispatcher>) -> Self {
        Self {
            dispatcher: Arc::downgrade(dispatcher),
        }
    }
}

impl WebSocketListener for EchoListener {
    fn opened(&self, uri: &str, client: ConnectionId) {
        debug!(uri = %uri, client = %client, "Echo client joined");
    }

    fn closed(&self, uri: &str, client: ConnectionId) {
        debug!(uri = %uri, client = %client, "Echo client left");
    }

    fn received(&self, uri: &str, client: ConnectionId, content: &[u8]) {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };
        match std::str::from_utf8(content) {
            Ok(text) => dispatcher.send_text(uri, client, text),
            Err(_) => dispatcher.send_binary(uri, client, content),
        };
    }
}
