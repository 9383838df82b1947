use clap::Parser;
use tracing::Level;

/// pg_usher: lightweight PostgreSQL connection pooler.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(default_value_t = String::from("pg_usher.ini"), env)]
    pub config_file: String,

    #[arg(short, long, default_value_t = Level::INFO, env)]
    pub log_level: Level,

    #[arg(
        short,
        long,
        default_value_t = false,
        env,
        help = "disable colors in the log output"
    )]
    pub no_color: bool,

    #[arg(
        short = 't',
        long = "test-config",
        default_value_t = false,
        help = "test configuration file and exit"
    )]
    pub test_config: bool,
}

pub fn parse() -> Args {
    Args::parse()
}
