use std::path::PathBuf;

use clap::Parser;
use sendrecv_lib::ClientId;

/// Calls a peer through the signaling server and receives its audio and
/// video.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    /// Peer to call
    pub peer_id: String,
    /// Signaling server URL [default: wss://webrtc.nirbheek.in:8443]
    #[arg(long)]
    pub server: Option<String>,
    /// TOML configuration file [default: ./sendrecv.toml if present]
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Register with this id instead of a random one
    #[arg(long)]
    pub client_id: Option<ClientId>,
    /// Also write warnings to <DIR>/sendrecv.log
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
}
