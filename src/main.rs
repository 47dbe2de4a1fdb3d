//! pob-bridge - send one action to a headless Path of Building engine.
//!
//! ```text
//! pob-bridge <action> [params-json]
//! ```
//!
//! Configuration comes from the `POB_*` environment variables. Logs go to
//! stderr; the result fields are printed to stdout as pretty JSON.

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pob_bridge::{BridgeConfig, BridgeSession};

fn usage() -> String {
    format!(
        "usage: {} <action> [params-json]\n\n\
         examples:\n  \
         pob-bridge ping\n  \
         pob-bridge get_stats '{{\"fields\":[\"Life\",\"TotalDPS\"]}}'",
        env!("CARGO_PKG_NAME")
    )
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(String, Option<Value>)> {
    let Some(action) = args.next() else {
        bail!("{}", usage());
    };
    if action == "-h" || action == "--help" {
        bail!("{}", usage());
    }

    let params = match args.next() {
        Some(raw) => Some(
            serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("params for `{}` are not valid JSON", action))?,
        ),
        None => None,
    };
    if args.next().is_some() {
        bail!("{}", usage());
    }
    Ok((action, params))
}

async fn run(action: String, params: Option<Value>) -> Result<()> {
    let config = BridgeConfig::from_env().context("invalid POB_* configuration")?;
    tracing::info!(transport = ?config.transport, "Connecting to engine");

    let session = BridgeSession::new(config);
    let client = session
        .ensure_client()
        .await
        .context("failed to start engine")?;

    let outcome = client.call(&action, params).await;
    session.stop_client().await;

    let fields = outcome.with_context(|| format!("`{}` failed", action))?;
    println!("{}", serde_json::to_string_pretty(&Value::Object(fields))?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pob_bridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let result = match parse_args(std::env::args().skip(1)) {
        Ok((action, params)) => run(action, params).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
