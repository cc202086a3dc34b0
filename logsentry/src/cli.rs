use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use logsentry_config::{Config, OverridableConfig};

use crate::cliapp::make_app;
use crate::setup;

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();
    let config_path = matches
        .get_one::<PathBuf>("config")
        .map_or(Path::new(".logsentry"), PathBuf::as_path);

    let mut config = Config::from_path(config_path).context("failed to load config")?;

    // Override file config with environment variables.
    config.apply_override(extract_config_env_vars())?;

    logsentry_log::init(config.logging());

    if let Some(matches) = matches.subcommand_matches("config") {
        manage_config(config, config_path, matches)
    } else if let Some(matches) = matches.subcommand_matches("run") {
        // Override config with run command args.
        config.apply_override(extract_config_args(matches))?;
        run(config)
    } else {
        unreachable!();
    }
}

/// Extract config arguments from a parsed command line arguments object.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        host: matches.get_one::<String>("host").cloned(),
        port: matches.get_one::<String>("port").cloned(),
        public_url: matches.get_one::<String>("public_url").cloned(),
        database_url: matches.get_one::<String>("database_url").cloned(),
        key_pepper: matches.get_one::<String>("key_pepper").cloned(),
        statsd: matches.get_one::<String>("statsd").cloned(),
    }
}

/// Extract config arguments from the environment.
fn extract_config_env_vars() -> OverridableConfig {
    OverridableConfig {
        host: env::var("LOGSENTRY_SERVER_HOST").ok(),
        port: env::var("LOGSENTRY_SERVER_PORT").ok(),
        public_url: env::var("LOGSENTRY_PUBLIC_URL").ok(),
        database_url: env::var("LOGSENTRY_DATABASE_URL").ok(),
        key_pepper: env::var("LOGSENTRY_KEY_PEPPER").ok(),
        statsd: env::var("LOGSENTRY_STATSD").ok(),
    }
}

fn manage_config(config: Config, path: &Path, matches: &ArgMatches) -> Result<()> {
    if let Some(matches) = matches.subcommand_matches("init") {
        let config_file = path.join("config.yml");
        if config_file.exists() && !matches.get_flag("overwrite") {
            bail!(
                "{} exists, pass --overwrite to replace it",
                config_file.display()
            );
        }

        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        config.save().context("failed to write config")?;
        println!("wrote {}", config_file.display());
        Ok(())
    } else if matches.subcommand_matches("show").is_some() {
        println!("{config:#?}");
        Ok(())
    } else {
        unreachable!();
    }
}

fn run(config: Config) -> Result<()> {
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;
    logsentry_server::run(config)?;
    Ok(())
}
