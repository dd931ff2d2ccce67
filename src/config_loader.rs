use crate::config::TopologyConfig;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::info;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

/// Load, parse and validate a topology description from a YAML file
pub fn load_config(config_path: &Path) -> Result<TopologyConfig> {
    info!("Loading topology from: {:?}", config_path);

    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open topology file '{}'", config_path.display()))?;

    let config: TopologyConfig = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse topology file '{}'", config_path.display()))?;

    config.validate()?;

    info!(
        "Loaded {} routers, {} hosts, {} router links",
        config.routers.len(),
        config.hosts.len(),
        config.links.len()
    );
    Ok(config)
}

/// Command-line settings that take precedence over the `general` section
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub command_timeout: Option<Duration>,
    pub metric_step: Option<u32>,
    pub no_backups: bool,
    pub namespace_prefix: Option<String>,
}

/// Apply CLI overrides and re-validate
pub fn apply_overrides(config: &mut TopologyConfig, overrides: &CliOverrides) -> Result<()> {
    if let Some(timeout) = overrides.command_timeout {
        info!("Overriding command timeout: {:?}", timeout);
        config.general.command_timeout = timeout;
    }
    if let Some(step) = overrides.metric_step {
        info!("Overriding metric step: {}", step);
        config.general.metric_step = step;
    }
    if overrides.no_backups {
        info!("Installing primary routes only");
        config.general.install_backups = false;
    }
    if let Some(prefix) = &overrides.namespace_prefix {
        config.general.namespace_prefix = prefix.clone();
    }

    config.validate()?;
    Ok(())
}
