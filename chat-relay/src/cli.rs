use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{
    event_loop::{DEFAULT_CAPACITY, RelayConfig},
    line::DEFAULT_MAX_LINE_LEN,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, serving every client from a single event-loop thread.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:10000")]
    pub listen: SocketAddr,

    /// Maximum number of simultaneously connected clients.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Longest unterminated line (in bytes) a client may send before being dropped.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LEN)]
    pub max_line_len: usize,
}

impl ServerArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            capacity: self.capacity,
            max_line_len: self.max_line_len,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:10000")]
    pub server: SocketAddr,

    /// Display name. Prompted for on stdin when omitted.
    #[arg(long)]
    pub name: Option<String>,
}
