#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod commands;
mod error_fmt;

use aqua_config::Config;
use aqua_core::predictor::TrainOptions;
use clap::Parser;
use cli::{Cli, Commands, DatasetCmd, FILE_GUARD, JSON_MODE};
use eyre::Result;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    if let Err(err) = real_main(cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            eprintln!("{}", error_fmt::format_error_json(&err));
        } else {
            eprintln!("{}", error_fmt::humanize(&err));
            tracing::debug!(error = ?err, "command failed");
        }
        std::process::exit(error_fmt::exit_code_for_error(&err));
    }
}

fn real_main(cli: Cli) -> Result<()> {
    let cfg = commands::load_config(cli.config.as_deref());
    // Logging needs [logging] when the config is readable; report config
    // errors after the console subscriber is up either way.
    init_tracing(cli.json, &cli.log_level, cfg.as_ref().ok());
    let cfg = cfg?;

    match cli.cmd {
        Commands::Run {
            simulate,
            duration_s,
        } => commands::run(&cfg, simulate, duration_s, cli.json),
        Commands::SelfCheck {
            simulate,
            timeout_ms,
        } => commands::self_check(&cfg, simulate, timeout_ms, cli.json),
        Commands::Dataset { cmd } => match cmd {
            DatasetCmd::Stats => commands::dataset_stats(&cfg, cli.json),
            DatasetCmd::Dump { out, format } => commands::dataset_dump(&cfg, out.as_deref(), format),
            DatasetCmd::Train {
                out,
                epochs,
                learning_rate,
            } => commands::dataset_train(
                &cfg,
                out,
                TrainOptions {
                    epochs,
                    learning_rate,
                },
                cli.json,
            ),
            DatasetCmd::Import { file } => commands::dataset_import(&cfg, &file, cli.json),
        },
    }
}

/// Console layer on stderr plus an optional non-blocking file layer from `[logging]`.
/// `RUST_LOG` wins over `--log-level`; the file layer uses `[logging] level`.
fn init_tracing(json: bool, cli_level: &str, cfg: Option<&Config>) {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli_level));
    let console = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter)
            .boxed()
    };

    let file_layer = cfg.and_then(|c| c.logging.file.as_deref()).map(|path| {
        let path = std::path::Path::new(path);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let name = path
            .file_name()
            .map_or_else(|| "aqua.log".into(), |n| n.to_string_lossy().into_owned());
        let rotation = match cfg.and_then(|c| c.logging.rotation.as_deref()) {
            Some("daily") => tracing_appender::rolling::Rotation::DAILY,
            Some("hourly") => tracing_appender::rolling::Rotation::HOURLY,
            _ => tracing_appender::rolling::Rotation::NEVER,
        };
        let appender = tracing_appender::rolling::RollingFileAppender::new(rotation, dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        let level = cfg
            .and_then(|c| c.logging.level.as_deref())
            .unwrap_or("info");
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new(level))
            .boxed()
    });

    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();
}
