use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use diskproxy_server::config::{Cli, EXIT_USAGE};
use diskproxy_server::{bootstrap, fatal};

fn main() {
    fatal::install();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return;
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(EXIT_USAGE);
        }
    };

    if let Err(err) = bootstrap::serve(cli) {
        eprintln!("diskproxy: {err}");
        std::process::exit(err.exit_code());
    }
}
