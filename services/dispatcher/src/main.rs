// ferry-dispatcher: predicate-routed fan-out of announced files.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};
use tracing::info;

use dispatcher::{DispatcherArgs, DispatcherService};

#[tokio::main]
async fn main() {
    let matches = Command::new("ferry-dispatcher")
        .version(env!("CARGO_PKG_VERSION"))
        .about("File-fabric dispatcher: route files by metadata predicates")
        .arg(
            Arg::new("config_file")
                .help("The configuration file to run on")
                .required(true),
        )
        .arg(
            Arg::new("publish_port")
                .help("Publish dispatch messages on this port")
                .short('p')
                .long("publish-port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("publish_nameserver")
                .help("Nameserver to register the publisher on (repeatable)")
                .short('n')
                .long("publish-nameserver")
                .action(ArgAction::Append),
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

    info!(version = env!("CARGO_PKG_VERSION"), "ferry-dispatcher starting");

    let args = DispatcherArgs {
        config_file: PathBuf::from(
            matches
                .get_one::<String>("config_file")
                .expect("config_file is required"),
        ),
        publish_port: matches.get_one::<u16>("publish_port").copied(),
        publish_nameservers: matches
            .get_many::<String>("publish_nameserver")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
    };

    let service = match DispatcherService::new(args).await {
        Ok(service) => service,
        Err(err) => {
            eprintln!("FATAL: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = service.run().await {
        eprintln!("FATAL: {err}");
        std::process::exit(1);
    }
}
