//! `ddp`: demo server publishing one in-memory collection.
//!
//! Methods `add(id, {message, ..})`, `set(id, {message, ..})` and `remove(id)` edit the
//! collection; subscribing to the publication named after it streams the
//! contents and every later edit.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ddp_core::{Fields, MethodError, Pattern, Value, check_param};
use ddp_server::loader::load_config;
use ddp_server::logging::init_subscriber;
use ddp_server::metrics::install_recorder;
use ddp_server::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use ddp_server::{DdpServer, LogFormat, async_method, publication};
use ddp_storage::{MemoryStore, Store};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "ddp", about = "DDP server over an in-memory collection")]
struct Args {
    /// Settings file (JSON). Missing files fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind, overriding the settings file.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, overriding the settings file.
    #[arg(long)]
    port: Option<u16>,

    /// Name of the collection and of its publication.
    #[arg(long, default_value = "test")]
    collection: String,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if args.json_logs {
        config.log_format = LogFormat::Json;
    }

    init_subscriber(&config.log_level, config.log_format);

    let store = MemoryStore::new(args.collection.as_str());
    let mut server = DdpServer::new(config);
    match install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(err) => warn!(error = %err, "metrics recorder unavailable, /metrics disabled"),
    }

    let source = store.clone();
    let _ = server
        .method("add", add_method(store.clone()))?
        .method("set", set_method(store.clone()))?
        .method("remove", remove_method(store))?
        .publish(
            &args.collection,
            publication(move |_| Ok(source.cursor().into())),
        )?;

    let handle = server.serve().await.context("failed to start server")?;
    info!(url = %handle.ws_url(), collection = %args.collection, "ddp server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    if !handle.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await {
        warn!("connections still open after shutdown timeout");
    }
    Ok(())
}

fn id_param(params: &[Value]) -> Result<String, MethodError> {
    Ok(check_param(params, 0, &Pattern::String)?
        .as_str()
        .unwrap_or_default()
        .to_owned())
}

/// Documents carry a string `message`; other fields pass through.
fn fields_param(params: &[Value]) -> Result<Fields, MethodError> {
    let document = Pattern::shape([("message", Pattern::String)]);
    Ok(check_param(params, 1, &document)?
        .as_object()
        .cloned()
        .unwrap_or_default())
}

fn add_method(store: MemoryStore) -> impl ddp_server::Method {
    async_method(move |params: Vec<Value>| {
        let store = store.clone();
        async move {
            let id = id_param(&params)?;
            let fields = fields_param(&params)?;
            Ok::<_, MethodError>(Value::from(store.add(&id, fields).await?))
        }
    })
}

fn set_method(store: MemoryStore) -> impl ddp_server::Method {
    async_method(move |params: Vec<Value>| {
        let store = store.clone();
        async move {
            let id = id_param(&params)?;
            let fields = fields_param(&params)?;
            Ok::<_, MethodError>(Value::from(store.set(&id, fields).await?))
        }
    })
}

fn remove_method(store: MemoryStore) -> impl ddp_server::Method {
    async_method(move |params: Vec<Value>| {
        let store = store.clone();
        async move {
            let id = id_param(&params)?;
            Ok::<_, MethodError>(Value::from(store.remove(&id).await?))
        }
    })
}
