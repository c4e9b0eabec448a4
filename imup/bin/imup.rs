use clap::Parser;
use tokio_util::sync::CancellationToken;

use imup_config::{logging, ClientConfig, ConfigHandle, Flags};

#[tokio::main]
async fn main() {
    let flags = Flags::parse();

    let cfg = match ClientConfig::resolve(&flags, &imup_common::env::process_env) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration of client is not valid: {err}");
            std::process::exit(1);
        }
    };

    logging::init(cfg.verbosity(), cfg.log_to_file());

    let cfg = ConfigHandle::new(cfg);
    let token = CancellationToken::new();

    if let Err(err) = imup::run::run(cfg, token, shutdown_signal()).await {
        tracing::error!(error = %err, "startup");
        std::process::exit(1);
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
