use clap::Parser;
use rpulse_load::config::{Args, Command, Config};
use rpulse_load::receiver::{self, ReceiverState};
use rpulse_load::{LoadTest, telemetry};
use std::process::ExitCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Exit code when a threshold fails, after the report has been printed
const THRESHOLDS_FAILED: u8 = 99;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Command::Run);

    // The receiver only needs a secret, so it doesn't go through full load test validation
    if let Command::Receive { bind } = command {
        let config: Config = Config::figment(&args).extract()?;
        if args.validate {
            println!("Configuration is valid.");
            return Ok(ExitCode::SUCCESS);
        }

        telemetry::init_telemetry()?;
        tracing::debug!("{:?}", args);

        let listener = TcpListener::bind(&bind).await?;
        receiver::serve(listener, ReceiverState::new(&config.webhook_secret), shutdown_signal()).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(&args)?;

    // If --validate flag is set, exit successfully after config validation
    if args.validate {
        println!("Configuration is valid.");
        return Ok(ExitCode::SUCCESS);
    }

    telemetry::init_telemetry()?;
    tracing::debug!("{:?}", args);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let summary_export = config.summary_export.clone();
    let report = LoadTest::new(config)?.run(shutdown).await?;

    println!("{report}");

    if let Some(path) = summary_export {
        report.write_json(&path)?;
        tracing::info!(path = %path.display(), "Summary written");
    }

    if report.thresholds_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::error!("Some thresholds have failed");
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}
