use clap::Parser;
use tracing_subscriber::EnvFilter;

use verifeed::app::RunOptions;

fn main() {
    let opts = RunOptions::parse();

    init_tracing();

    if let Err(err) = verifeed::run(opts) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
