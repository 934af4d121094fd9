use crate::config::Config;
use clap::Args;
use eyre::WrapErr;
use relay_service_rs::Service;
use tokio::signal;
use tracing::info;

#[derive(Debug, Args)]
#[clap(about = "📡 serving proposer registrations to block builders")]
pub struct Command {
    #[clap(env, default_value = "config.toml")]
    config_file: String,
}

impl Command {
    pub async fn execute(self) -> eyre::Result<()> {
        let config = Config::from_toml_file(&self.config_file)?;

        let network = config.network;
        info!("configured for {network}");

        let Some(config) = config.relay else {
            return Err(eyre::eyre!("missing relay config from file provided"))
        };

        let mut handle =
            Service::from(network, config).spawn().await.wrap_err("could not start relay")?;
        let interrupted = tokio::select! {
            result = &mut handle => {
                result?;
                false
            }
            _ = signal::ctrl_c() => true,
        };
        if interrupted {
            info!("shutting down...");
            Ok(handle.shutdown().await?)
        } else {
            Err(eyre::eyre!("relay stopped unexpectedly"))
        }
    }
}
