use eyre::WrapErr;
use relay_rs::{config::from_toml_file, Network};
use relay_service_rs::Config as RelayConfig;
use serde::Deserialize;
use std::{fmt, path::Path};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    pub relay: Option<RelayConfig>,
}

impl Config {
    pub fn from_toml_file<P: AsRef<Path> + fmt::Display>(path: P) -> eyre::Result<Config> {
        tracing::info!("loading config from `{path}`...");

        from_toml_file::<_, Self>(path.as_ref())
            .wrap_err_with(|| format!("could not load config from `{path}`"))
    }
}
