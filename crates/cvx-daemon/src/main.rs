// SPDX-License-Identifier: MIT OR Apache-2.0
use anyhow::{Context, Result};
use clap::Parser;
use cvx_config::{ServiceConfig, load_config, validate_config};
use cvx_daemon::{AppState, build_app};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cvx-daemon", version, about = "Convert backplane daemon")]
struct Args {
    /// TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Bind address; overrides the config file and `CVX_BIND`.
    #[arg(long)]
    bind: Option<String>,

    /// Enable debug logging for the daemon and the engine.
    #[arg(long)]
    debug: bool,

    /// Validate the configuration, report warnings, and exit.
    #[arg(long)]
    check_config: bool,

    /// Print the configuration JSON schema and exit.
    #[arg(long)]
    print_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_schema {
        let schema = schemars::schema_for!(ServiceConfig);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let mut config = load_config(args.config.as_deref()).context("load config")?;
    if let Some(bind) = args.bind {
        config.bind = Some(bind);
    }

    if args.check_config {
        return check_config(&config);
    }

    let level = if args.debug {
        "debug"
    } else {
        config.log_level()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,cvx={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in validate_config(&config).context("invalid config")? {
        warn!(target: "cvx.daemon", "{warning}");
    }

    let state = Arc::new(AppState::new(config).context("build upstream client")?);
    let bind = state.config.bind_addr().to_string();
    let tools: Vec<&str> = state.config.tools.keys().map(String::as_str).collect();
    info!(target: "cvx.daemon", tools = ?tools, "tools loaded");
    let app = build_app(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(target: "cvx.daemon", %bind, "cvx-daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    info!(target: "cvx.daemon", "shut down");
    Ok(())
}

fn check_config(config: &ServiceConfig) -> Result<()> {
    let warnings = validate_config(config).context("invalid config")?;
    for warning in &warnings {
        println!("warning: {warning}");
    }

    let mut missing = 0usize;
    for (name, tool) in &config.tools {
        if !cvx_exec::program_exists(&tool.program) {
            println!("warning: tool '{name}': program '{}' not found", tool.program);
            missing += 1;
        }
    }

    println!(
        "config ok: {} tool(s), {} warning(s)",
        config.tools.len(),
        warnings.len() + missing
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "cvx.daemon", error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!(target: "cvx.daemon", "shutdown requested");
}
