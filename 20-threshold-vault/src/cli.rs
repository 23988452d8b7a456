use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::PeerId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one server replica until ctrl-c.
    Replica(ReplicaArgs),
    /// Store a secret under a key.
    Put(PutArgs),
    /// Fetch the secret stored under a key.
    Get(GetArgs),
    /// Serve end-user enroll and login requests.
    Gateway(GatewayArgs),
    /// Enroll a user through a gateway.
    Enroll(EnrollArgs),
    /// Log a user in through a gateway.
    Login(LoginArgs),
    /// Print a localhost cluster configuration as JSON.
    SampleConfig(SampleConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    /// Path to the cluster configuration JSON.
    #[arg(long, default_value = "cluster.json")]
    pub config: PathBuf,

    /// This process's peer id.
    #[arg(long)]
    pub id: PeerId,
}

#[derive(Args, Debug, Clone)]
pub struct ReplicaArgs {
    #[command(flatten)]
    pub peer: PeerArgs,

    /// Seconds an inbound connection has to send its intro.
    #[arg(long, default_value_t = 5)]
    pub intro_timeout_secs: u64,

    /// Evict request instances older than this many seconds; keeps everything when unset.
    #[arg(long)]
    pub max_age_secs: Option<u64>,

    /// Ask the other replicas for missed writes after starting.
    #[arg(long)]
    pub catch_up: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PutArgs {
    #[command(flatten)]
    pub peer: PeerArgs,

    pub key: String,

    pub secret: String,

    /// Seconds to wait for a quorum.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub peer: PeerArgs,

    pub key: String,

    /// Seconds to wait for a quorum.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct GatewayArgs {
    #[command(flatten)]
    pub peer: PeerArgs,

    /// Seconds each PUT or GET may take on behalf of a user.
    #[arg(long, default_value_t = 10)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct EnrollArgs {
    #[command(flatten)]
    pub peer: PeerArgs,

    /// Peer id of the gateway to enroll with.
    #[arg(long)]
    pub gateway: PeerId,

    pub username: String,

    pub password: String,

    #[arg(long, default_value_t = 15)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LoginArgs {
    #[command(flatten)]
    pub peer: PeerArgs,

    /// Peer id of the gateway to log in with.
    #[arg(long)]
    pub gateway: PeerId,

    pub username: String,

    #[arg(long, default_value_t = 15)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SampleConfigArgs {
    /// Maximum number of faulty servers; the cluster has 3f+1 servers.
    #[arg(long, default_value_t = 2)]
    pub f: usize,

    /// Decryption shares needed to reconstruct a secret.
    #[arg(long, default_value_t = 3)]
    pub threshold: usize,

    /// Port of server 0; every peer listens on base port + id.
    #[arg(long, default_value_t = 7100)]
    pub base_port: u16,

    /// Client and gateway ids to include.
    #[arg(long, value_delimiter = ',', default_value = "100,101")]
    pub clients: Vec<PeerId>,
}
