//! One-command SDK onboarding.
//!
//! `logsentry-sdk init` walks the device-authorization flow: it starts a
//! session on the server, points the user's browser at the verification URL,
//! polls until the user authorizes, and stores the minted credentials in the
//! local credentials file for [`init`](crate::init) to pick up.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, ValueHint};
use serde::Deserialize;

use crate::credentials::{Credentials, default_path};

const ABOUT: &str = "LogSentry SDK onboarding";

fn init_args() -> Vec<Arg> {
    vec![
        Arg::new("app_name")
            .long("app-name")
            .required(true)
            .help("Name for the app to register"),
        Arg::new("description")
            .long("description")
            .help("Optional app description"),
        Arg::new("dsn")
            .long("dsn")
            .value_hint(ValueHint::Url)
            .default_value("http://localhost:8001")
            .help("Server base URL"),
        Arg::new("timeout_seconds")
            .long("timeout-seconds")
            .value_parser(clap::value_parser!(u64))
            .default_value("300")
            .help("Polling timeout"),
        Arg::new("no_browser")
            .long("no-browser")
            .action(ArgAction::SetTrue)
            .help("Do not auto-open the browser"),
        Arg::new("config_path")
            .long("config-path")
            .value_parser(clap::builder::ValueParser::path_buf())
            .help("Override the credentials file path"),
    ]
}

/// Defines the command line app.
pub fn make_app() -> Command {
    Command::new("logsentry-sdk")
        .about(ABOUT)
        .subcommand_required(true)
        .subcommand(
            Command::new("init")
                .about("Login in the browser and provision app credentials")
                .args(init_args()),
        )
        .subcommand(
            Command::new("login")
                .about("Alias for init")
                .args(init_args()),
        )
        .subcommand(
            Command::new("status").about("Show the current local credentials").arg(
                Arg::new("config_path")
                    .long("config-path")
                    .value_parser(clap::builder::ValueParser::path_buf())
                    .help("Override the credentials file path"),
            ),
        )
}

/// Runs the command line app.
pub fn execute() -> Result<()> {
    let matches = make_app().get_matches();

    match matches.subcommand() {
        Some(("init" | "login", matches)) => cmd_init(matches),
        Some(("status", matches)) => cmd_status(matches),
        _ => unreachable!(),
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    device_code: String,
    user_code: String,
    verification_url: String,
    poll_interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: String,
    api_key: Option<String>,
    app_id: Option<String>,
    dsn: Option<String>,
}

fn credentials_file(matches: &ArgMatches) -> Result<PathBuf> {
    match matches.get_one::<PathBuf>("config_path") {
        Some(path) => Ok(path.clone()),
        None => default_path().context("could not determine the home directory"),
    }
}

fn cmd_init(matches: &ArgMatches) -> Result<()> {
    let dsn = matches
        .get_one::<String>("dsn")
        .expect("dsn has a default")
        .trim_end_matches('/')
        .to_owned();
    let timeout = Duration::from_secs(*matches.get_one::<u64>("timeout_seconds").unwrap());
    let app_name = matches.get_one::<String>("app_name").unwrap().clone();
    let description = matches.get_one::<String>("description").cloned();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the runtime")?;

    runtime.block_on(async {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        let start: StartResponse = client
            .post(format!("{dsn}/sdk/device/start"))
            .json(&serde_json::json!({
                "app_name": app_name,
                "description": description,
            }))
            .send()
            .await
            .context("failed to reach the server")?
            .error_for_status()
            .context("failed to start the login flow")?
            .json()
            .await?;

        println!("Open this URL to login and link your app:");
        println!("{}", start.verification_url);
        println!("If prompted, enter code: {}", start.user_code);

        if !matches.get_flag("no_browser") {
            open_browser(&start.verification_url);
        }

        let interval = Duration::from_secs(start.poll_interval_seconds.max(1));
        let started = Instant::now();

        loop {
            tokio::time::sleep(interval).await;

            if started.elapsed() > timeout {
                bail!("timed out waiting for approval");
            }

            let response = client
                .get(format!("{dsn}/sdk/device/poll"))
                .query(&[("device_code", &start.device_code)])
                .send()
                .await;

            let Ok(response) = response else {
                continue;
            };

            // 429 means we polled early; any 4xx/5xx other than the
            // protocol's 410 statuses is retried as transient.
            let poll: PollResponse = match response.json().await {
                Ok(poll) => poll,
                Err(_) => continue,
            };

            match poll.status.as_str() {
                "ok" => {
                    let credentials = Credentials {
                        api_key: poll.api_key.context("server response misses api_key")?,
                        dsn: poll.dsn.unwrap_or_else(|| dsn.clone()),
                        app_id: poll.app_id.context("server response misses app_id")?,
                        app_name: app_name.clone(),
                    };

                    let path = credentials_file(matches)?;
                    credentials
                        .save_to(&path)
                        .with_context(|| format!("failed to write {}", path.display()))?;

                    println!();
                    println!("Linked app '{}' ({}).", credentials.app_name, credentials.app_id);
                    println!("Credentials saved to {}.", path.display());
                    println!("Use in code:");
                    println!("  let _client = logsentry_sdk::init(Default::default())?;");
                    return Ok(());
                }
                "expired" | "consumed" | "denied" => {
                    bail!("device session is {}; run init again", poll.status);
                }
                _ => continue, // pending
            }
        }
    })
}

fn cmd_status(matches: &ArgMatches) -> Result<()> {
    let path = credentials_file(matches)?;
    let Some(credentials) = Credentials::load_from(&path) else {
        println!("No credentials found at {}", path.display());
        std::process::exit(1);
    };

    println!("App: {}", credentials.app_name);
    println!("App ID: {}", credentials.app_id);
    println!("DSN: {}", credentials.dsn);
    println!(
        "API key present: {}",
        if credentials.api_key.is_empty() { "no" } else { "yes" }
    );
    Ok(())
}

/// Best-effort browser launch; failures only mean the user opens the URL
/// themselves.
fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let command = "open";
    #[cfg(not(target_os = "macos"))]
    let command = "xdg-open";

    std::process::Command::new(command)
        .arg(url)
        .spawn()
        .map(drop)
        .ok();
}
