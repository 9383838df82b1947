use log::info;
use tracing_subscriber::EnvFilter;

use super::args::Args;

pub fn init_logging(args: &Args) {
    // Default filter from the environment, overridden by the command line.
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!args.no_color)
        .init();

    info!(
        "Welcome to pg_usher! (Version {})",
        env!("CARGO_PKG_VERSION")
    );
}
