use anyhow::Result;
use logsentry_config::Config;

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    logsentry_log::info!(
        "launching logsentry from config folder {}",
        config.path().display()
    );
    logsentry_log::info!("  listen address: {}", config.listen_addr());
    logsentry_log::info!("  public url: {}", config.public_url());
    logsentry_log::info!("  store: {}", config.store_url());
    logsentry_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(addr) = config.statsd_addr() else {
        return Ok(());
    };

    logsentry_statsd::init(
        config.metrics_prefix(),
        addr,
        config.metrics_default_tags().clone(),
        config.metrics_sample_rate(),
    )?;

    Ok(())
}
