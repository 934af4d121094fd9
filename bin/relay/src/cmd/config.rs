use crate::config::Config;
use clap::Args;

#[derive(Debug, Args)]
#[clap(about = "🔬 (debug) utility to verify configuration")]
pub struct Command {
    #[clap(env)]
    config_file: String,
}

impl Command {
    pub async fn execute(self) -> eyre::Result<()> {
        let config = Config::from_toml_file(&self.config_file)?;
        tracing::info!("{config:#?}");

        Ok(())
    }
}
