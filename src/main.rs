use std::process::exit;

use log::error;

use pg_usher::app::{self, args, logger};
use pg_usher::config::{self, Config};
use pg_usher::pool::Bouncer;

fn main() {
    let cli = args::parse();
    logger::init_logging(&cli);

    if cli.test_config {
        let mut bouncer = Bouncer::new(Config::default());
        match config::load_config(&mut bouncer, &cli.config_file, false) {
            Ok(()) => {
                println!("configuration file {} is ok", cli.config_file);
                exit(0);
            }
            Err(err) => {
                error!("{err}");
                exit(1);
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("cannot build runtime: {err}");
            exit(1);
        }
    };

    if let Err(err) = runtime.block_on(app::run(cli)) {
        error!("{err}");
        exit(1);
    }
}
