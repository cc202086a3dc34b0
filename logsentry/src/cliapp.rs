//! This module implements the definition of the command line app.

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, Command, ValueHint};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "The LogSentry log telemetry server.";

pub fn make_app() -> Command {
    Command::new("logsentry")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_hint(ValueHint::DirPath)
                .value_parser(ValueParser::path_buf())
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the server")
                .after_help(
                    "This runs the server in the foreground until it's shut down. It will bind \
                    to the port and network interface configured in the config file.",
                )
                .arg(
                    Arg::new("host")
                        .long("host")
                        .help("The network interface to bind to"),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .short('p')
                        .help("The port to bind to"),
                )
                .arg(
                    Arg::new("public_url")
                        .value_name("url")
                        .value_hint(ValueHint::Url)
                        .long("public-url")
                        .help("The externally visible base URL of this server"),
                )
                .arg(
                    Arg::new("database_url")
                        .value_name("url")
                        .long("database-url")
                        .help("The SQLite URL of the document store"),
                )
                .arg(
                    Arg::new("key_pepper")
                        .long("key-pepper")
                        .help("The per-installation API key pepper"),
                )
                .arg(
                    Arg::new("statsd")
                        .long("statsd")
                        .help("Hostname and port of the statsd server"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the config file")
                .subcommand_required(true)
                .subcommand(
                    Command::new("init")
                        .about("Write the default config to the config folder")
                        .arg(
                            Arg::new("overwrite")
                                .long("overwrite")
                                .action(ArgAction::SetTrue)
                                .help("Overwrite an existing config file"),
                        ),
                )
                .subcommand(Command::new("show").about("Print the loaded config")),
        )
}
