//! `stepwise config`: show or initialise `config.toml`.

use anyhow::{bail, Context, Result};
use console::style;
use stepwise_infra::config::{load_engine_config, resolve_data_dir, save_engine_config, CONFIG_FILE};

use super::print_json;

pub async fn handle_config(init: bool, force: bool, json: bool) -> Result<()> {
    let data_dir = resolve_data_dir();
    let config_path = data_dir.join(CONFIG_FILE);
    let config = load_engine_config(&data_dir).await;

    if init {
        if config_path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", config_path.display());
        }
        let written = save_engine_config(&data_dir, &config)
            .await
            .context("failed to write config.toml")?;
        if !json {
            println!();
            println!("  {} Wrote {}", style("*").green().bold(), style(written.display()).cyan());
        }
    }

    if json {
        return print_json(&serde_json::json!({
            "path": config_path,
            "exists": config_path.exists(),
            "config": config,
        }));
    }

    let body = toml::to_string_pretty(&config).context("failed to render config")?;
    println!();
    println!("  {} ({})", style("Engine configuration").bold(), config_path.display());
    println!();
    for line in body.lines() {
        println!("    {line}");
    }
    println!();
    Ok(())
}
