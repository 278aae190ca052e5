// ferry-server: watch directories, announce files, serve transfer requests.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use tracing::info;

use server::{MoveServer, ServerArgs};

#[tokio::main]
async fn main() {
    let matches = Command::new("ferry-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("File-fabric producer: watch, announce, serve")
        .arg(
            Arg::new("config_file")
                .help("The configuration file to run on")
                .required(true),
        )
        .arg(
            Arg::new("port")
                .help("The port to publish on")
                .short('p')
                .long("port")
                .value_parser(clap::value_parser!(u16))
                .default_value("9010"),
        )
        .arg(
            Arg::new("disable_backlog")
                .help("Skip replay of files already on disk at start/reload")
                .long("disable-backlog")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("watchdog")
                .help("Use the polling watcher instead of kernel events")
                .short('w')
                .long("watchdog")
                .action(ArgAction::SetTrue),
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

    info!(version = env!("CARGO_PKG_VERSION"), "ferry-server starting");

    let args = ServerArgs {
        config_file: PathBuf::from(
            matches
                .get_one::<String>("config_file")
                .expect("config_file is required"),
        ),
        publish_port: *matches.get_one::<u16>("port").expect("port has a default"),
        disable_backlog: matches.get_flag("disable_backlog"),
        force_polling: matches.get_flag("watchdog"),
    };

    let server = match MoveServer::new(args).await {
        Ok(server) => server,
        Err(err) => {
            eprintln!("FATAL: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("FATAL: {err}");
        std::process::exit(1);
    }
}
