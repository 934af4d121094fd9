use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

pub fn from_toml_file<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> Result<T, Error> {
    let config_data = std::fs::read_to_string(path.as_ref())?;
    toml::from_str(&config_data).map_err(From::from)
}
