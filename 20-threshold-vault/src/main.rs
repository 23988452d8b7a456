use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use threshold_vault::{
    cli::{Cli, Command, PeerArgs},
    client::Client,
    config::ClusterConfig,
    dispatcher::RetentionPolicy,
    gateway::Gateway,
    replica::{ReplicaConfig, spawn_replica},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

async fn client(peer: &PeerArgs) -> Result<Client> {
    let cluster = ClusterConfig::load(&peer.config)?;
    Client::connect(&cluster, peer.id).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Replica(args) => {
            let cluster = ClusterConfig::load(&args.peer.config)?;
            let mut config = ReplicaConfig::new(args.peer.id, cluster);
            config.intro_timeout = Duration::from_secs(args.intro_timeout_secs);
            config.catch_up_on_start = args.catch_up;
            if let Some(secs) = args.max_age_secs {
                config.retention = RetentionPolicy::MaxAge(Duration::from_secs(secs));
            }
            let replica = spawn_replica(config).await?;
            info!("replica {} listening on {}", replica.id(), replica.local_addr());
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            replica.shutdown().await?;
        }
        Command::Put(args) => {
            let client = client(&args.peer).await?;
            client
                .put(&args.key, args.secret.into_bytes(), Duration::from_secs(args.timeout_secs))
                .await?;
            println!("stored {}", args.key);
            client.shutdown().await?;
        }
        Command::Get(args) => {
            let client = client(&args.peer).await?;
            let secret = client
                .get(&args.key, Duration::from_secs(args.timeout_secs))
                .await?;
            println!("{}", String::from_utf8_lossy(&secret));
            client.shutdown().await?;
        }
        Command::Gateway(args) => {
            let gateway = Gateway::new(
                client(&args.peer).await?,
                Duration::from_secs(args.timeout_secs),
            )?;
            tokio::select! {
                result = gateway.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("gateway shutting down"),
            }
        }
        Command::Enroll(args) => {
            let client = client(&args.peer).await?;
            let response = client
                .enroll(
                    args.gateway,
                    &args.username,
                    &args.password,
                    Duration::from_secs(args.timeout_secs),
                )
                .await?;
            println!("enrolled {}", response.username);
            client.shutdown().await?;
        }
        Command::Login(args) => {
            let client = client(&args.peer).await?;
            let response = client
                .login(
                    args.gateway,
                    &args.username,
                    Vec::new(),
                    Duration::from_secs(args.timeout_secs),
                )
                .await?;
            println!(
                "logged in {}: {}",
                response.username,
                String::from_utf8_lossy(&response.encrypted_blob)
            );
            client.shutdown().await?;
        }
        Command::SampleConfig(args) => {
            let config = ClusterConfig::local(args.f, args.threshold, args.base_port, &args.clients)?;
            config.validate()?;
            let json = serde_json::to_string_pretty(&config).context("failed to encode config")?;
            println!("{json}");
        }
    }

    Ok(())
}
