use clap::Parser;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use replicatord::{app, cli::Cli, config};

fn main() {
    let cli = Cli::parse();

    let cfg = match config::load(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&cfg.log_level);

    if let Err(e) = app::run(cfg) {
        tracing::error!("fatal startup error: {e}");
        std::process::exit(1);
    }
}

/// Structured logging to stdout, level fixed once at startup from the
/// resolved configuration (spec.md §6: "the level is set once at startup").
fn init_tracing(log_level: &str) {
    let (writer, guard) = non_blocking(std::io::stdout());
    // Leaked deliberately: the non-blocking writer's background thread must
    // outlive `main`, and this process never tears tracing back down before
    // exiting.
    let _ = Box::leak(Box::new(guard));
    let layer = fmt::layer().with_writer(writer).with_ansi(false).with_filter(EnvFilter::new(log_level));
    tracing_subscriber::registry().with(layer).init();
}
