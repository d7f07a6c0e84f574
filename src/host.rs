//! `farcall-host`: expose a demo object over newline-delimited JSON on stdio.
//!
//! Each input line is one inbound message; each outbound envelope is written as
//! one line. The exposed object is a [`Record`] seeded from an optional state
//! file plus a few methods that exercise callbacks and pending results:
//!
//! - `echo(...args)`: returns the argument list
//! - `delay(ms, value)`: resolves to `value` after `ms` milliseconds
//! - `forEach(list, callback)`: calls `callback(item, index)` for each item
//! - `fail(message)`: throws a `HostError`

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::channel::mpsc;
use futures::io::BufReader;
use futures::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, StreamExt as _};
use tokio_util::compat::{TokioAsyncReadCompatExt as _, TokioAsyncWriteCompatExt as _};

use crate::endpoint::Endpoint;
use crate::error::Exception;
use crate::logging::{self, LOG_ENV, LogFormat};
use crate::registry::Registry;
use crate::value::{Record, RemoteObject, Value};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct HostArgs {
    /// JSON or TOML file whose top-level table seeds the exposed object
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Log filter, in `EnvFilter` syntax
    #[arg(long, env = LOG_ENV, default_value = "info")]
    pub log: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl HostArgs {
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(&self.log, self.log_format)?;

        let state = match &self.state {
            Some(path) => load_state(path)?,
            None => serde_json::Value::Object(Default::default()),
        };
        let object = playground(state)?;

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                tokio::select! {
                    result = serve(object, tokio::io::stdin().compat(), tokio::io::stdout().compat_write()) => result,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted");
                        Ok(())
                    }
                }
            })
            .await
    }
}

/// Read a state file. `.toml` files are parsed as TOML, everything else as JSON.
pub fn load_state(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let state: serde_json::Value = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&text)
            .with_context(|| format!("failed to parse {} as TOML", path.display()))?,
        _ => serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {} as JSON", path.display()))?,
    };
    if !state.is_object() {
        anyhow::bail!(
            "state file {} must contain a table at the top level",
            path.display()
        );
    }
    Ok(state)
}

/// The object `farcall-host` exposes.
pub fn playground(state: serde_json::Value) -> anyhow::Result<Rc<Record>> {
    let record = Record::from_json(state)?;

    record.insert(
        "echo",
        Value::function(|args| {
            let items = args
                .iter()
                .map(Value::to_transmissible)
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Value::Json(serde_json::Value::Array(items)))
        }),
    );

    record.insert(
        "delay",
        Value::function(|args| {
            let millis = args
                .first()
                .and_then(Value::as_json)
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| Exception::new("TypeError", "delay expects a millisecond count"))?;
            let value = args.get(1).cloned().unwrap_or(Value::Undefined);
            Ok(Value::pending(async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(value)
            }))
        }),
    );

    record.insert(
        "forEach",
        Value::function(|args| {
            let items = match args.first().and_then(Value::as_json) {
                Some(serde_json::Value::Array(items)) => items.clone(),
                _ => return Err(Exception::new("TypeError", "forEach expects a list").into()),
            };
            let callback = args.get(1).cloned().unwrap_or(Value::Undefined);
            for (index, item) in items.into_iter().enumerate() {
                callback.invoke(vec![Value::Json(item), Value::Json(index.into())])?;
            }
            Ok(Value::Undefined)
        }),
    );

    record.insert(
        "fail",
        Value::function(|args| {
            let message = args
                .first()
                .and_then(Value::as_json)
                .and_then(serde_json::Value::as_str)
                .unwrap_or("failure requested");
            Err(Exception::new("HostError", message).into())
        }),
    );

    Ok(Rc::new(record))
}

/// Expose `object` over a line-oriented byte stream until `incoming` ends and
/// every response has been written. Must run inside a `LocalSet`.
pub async fn serve(
    object: Rc<dyn RemoteObject>,
    incoming: impl AsyncRead + Unpin,
    outgoing: impl AsyncWrite + Unpin,
) -> anyhow::Result<()> {
    let (inbound_tx, inbound_rx) = mpsc::unbounded();
    let (outbound_tx, outbound_rx) = mpsc::unbounded();

    let registry = Registry::new();
    let endpoint = Endpoint::new(outbound_tx, inbound_rx);
    let handle = registry.bind(object, &endpoint)?;
    // The listener and any in-flight work hold their own outboxes; once they are
    // gone the outgoing actor sees the channel close.
    drop(endpoint);

    let result = futures::try_join!(
        incoming_actor(incoming, inbound_tx),
        outgoing_actor(outbound_rx, outgoing),
    );
    handle.dispose();
    result.map(|_| ())
}

/// Parse each line of `incoming` and queue it for the listener.
async fn incoming_actor(
    incoming: impl AsyncRead + Unpin,
    inbound_tx: mpsc::UnboundedSender<serde_json::Value>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(incoming).lines();
    while let Some(line) = lines.next().await {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(message) => {
                if inbound_tx.unbounded_send(message).is_err() {
                    break;
                }
            }
            Err(error) => tracing::warn!(%error, "skipping unparsable line"),
        }
    }
    tracing::debug!("input closed");
    Ok(())
}

/// Write each outbound envelope as one line.
async fn outgoing_actor(
    mut outbound_rx: mpsc::UnboundedReceiver<serde_json::Value>,
    mut outgoing: impl AsyncWrite + Unpin,
) -> anyhow::Result<()> {
    while let Some(message) = outbound_rx.next().await {
        let mut bytes = serde_json::to_vec(&message)?;
        bytes.push(b'\n');
        outgoing
            .write_all(&bytes)
            .await
            .context("failed to write output")?;
        outgoing.flush().await?;
    }
    Ok(())
}
