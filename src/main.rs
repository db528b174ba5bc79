use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use fluux_xmpp::{EngineConfig, Jid, Message, Presence, XmppEngine};

#[derive(Parser, Debug)]
#[command(name = "fluux-xmpp", version, about = "Connect to an XMPP server and log the traffic")]
struct Cli {
    /// Account address, e.g. alice@example.com/laptop
    #[arg(long)]
    jid: Option<String>,

    /// Account password (falls back to $FLUUX_XMPP_PASSWORD)
    #[arg(long, env = "FLUUX_XMPP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect here instead of resolving the domain (tcp://host:port or host:port)
    #[arg(long)]
    server: Option<String>,

    /// Send a chat message to this address once connected
    #[arg(long, requires = "message")]
    to: Option<String>,

    #[arg(long, requires = "to")]
    message: Option<String>,

    /// Verbose logging to stderr; `--verbose=xmpp` also logs every stanza
    #[arg(short, long, num_args = 0..=1, default_missing_value = "default")]
    verbose: Option<String>,

    /// Override the log file directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Disable TLS certificate verification (INSECURE!)
    #[arg(long)]
    dangerous_insecure_tls: bool,
}

fn default_log_dir() -> PathBuf {
    //   Linux:   ~/.local/share/fluux-xmpp/logs/  (or $XDG_DATA_HOME)
    //   macOS:   ~/Library/Logs/fluux-xmpp/
    //   Windows: %LOCALAPPDATA%\fluux-xmpp\logs\
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fluux-xmpp")
        .join("logs");

    #[cfg(target_os = "macos")]
    let dir = dirs::home_dir()
        .map(|h| h.join("Library").join("Logs").join("fluux-xmpp"))
        .unwrap_or(dir);

    dir
}

/// File log always, stderr when verbose. Returns the guard of the file writer.
fn init_tracing(cli: &Cli) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = cli.log_dir.clone().unwrap_or_else(default_log_dir);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_xmpp=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-xmpp.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if cli.verbose.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if cli.verbose.as_deref() == Some("xmpp") {
            EnvFilter::new("fluux_xmpp=debug,info")
        } else {
            EnvFilter::new("fluux_xmpp=info,fluux_xmpp::wire=off,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    eprintln!("Log file: {}", log_dir.display());
    guard
}

fn engine_config(cli: &Cli, jid: Option<&Jid>) -> anyhow::Result<EngineConfig> {
    let mut config = match (&cli.config, jid) {
        (Some(path), _) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(jid)) => EngineConfig::new(jid.domain()),
        (None, None) => bail!("either --jid or --config is required"),
    };
    if let Some(server) = &cli.server {
        config.server = Some(server.clone());
    }
    if cli.dangerous_insecure_tls {
        config.dangerous_insecure_tls = true;
    }
    if cli.verbose.as_deref() == Some("xmpp") {
        config.debug_stanzas = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(&cli);

    if cli.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let jid: Option<Jid> = cli
        .jid
        .as_deref()
        .map(str::parse::<Jid>)
        .transpose()
        .context("invalid --jid")?;
    let config = engine_config(&cli, jid.as_ref())?;
    let engine = XmppEngine::new(config)?;

    engine.on_error(|e| warn!(error = %e, "Connection error"));
    engine.on_message(|m| {
        let from = m.header.from.as_ref().map(Jid::to_string).unwrap_or_default();
        match m.body() {
            Some(body) => info!(from = %from, "Message: {}", body),
            None => info!(from = %from, "Message without body"),
        }
    });
    engine.on_presence(|p| {
        let from = p.header.from.as_ref().map(Jid::to_string).unwrap_or_default();
        info!(from = %from, presence_type = p.presence_type.as_deref().unwrap_or("available"), "Presence");
    });
    engine.on_iq(|iq| info!(id = iq.id().unwrap_or(""), iq_type = %iq.iq_type, "Incoming iq"));

    if let Some(jid) = &jid {
        if let Some(node) = jid.node() {
            let password = cli.password.clone().context("--password is required with --jid")?;
            engine.set_credentials(node, password);
        }
    }
    engine
        .connect(jid.as_ref().and_then(Jid::resource))
        .await
        .context("connecting")?;
    info!(jid = ?engine.jid(), state = %engine.state(), "Session established");

    if engine.is_authenticated() {
        engine.send_presence(Presence::default()).await?;
        if let (Some(to), Some(body)) = (&cli.to, &cli.message) {
            let to: Jid = to.parse().context("invalid --to")?;
            engine.send_message(Message::chat(to, body)).await?;
        }
        match engine.ping().await {
            Ok(rtt) => info!(rtt_ms = rtt.as_millis() as u64, "Server ping"),
            Err(e) => warn!(error = %e, "Server ping failed"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, closing");
    engine.close().await;
    Ok(())
}
