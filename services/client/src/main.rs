// ferry-client: subscribe, fetch, republish.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use tracing::info;

use client::{ClientArgs, MoveClient};

#[tokio::main]
async fn main() {
    let matches = Command::new("ferry-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("File-fabric consumer: subscribe, fetch, republish")
        .arg(
            Arg::new("config_file")
                .help("The configuration file to run on")
                .required(true),
        )
        .arg(
            Arg::new("verbosity")
                .help("Increase verbosity (-v info, -vv debug)")
                .short('v')
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("log")
                .help("Log to this file instead of stdout")
                .short('l')
                .long("log"),
        )
        .arg(
            Arg::new("log_config")
                .help("Log filter configuration file")
                .short('c')
                .long("log-config"),
        )
        .get_matches();

    if let Err(err) = ferry_logging::init(
        matches.get_count("verbosity"),
        matches.get_one::<String>("log").map(PathBuf::from).as_deref(),
        matches
            .get_one::<String>("log_config")
            .map(PathBuf::from)
            .as_deref(),
    ) {
        eprintln!("FATAL: {err}");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "ferry-client starting");

    let client = MoveClient::new(ClientArgs {
        config_file: PathBuf::from(
            matches
                .get_one::<String>("config_file")
                .expect("config_file is required"),
        ),
    });

    if let Err(err) = client.run().await {
        eprintln!("FATAL: {err}");
        std::process::exit(1);
    }
}
