use clap::Parser;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Line-based broadcast chat server")]
pub struct Args {
    /// Address to listen on
    #[arg(default_value = "0.0.0.0:7000")]
    pub listen: String,

    /// Longest accepted line in bytes, terminator excluded
    #[arg(long, default_value_t = 4096)]
    pub max_line_len: usize,

    /// Outbound messages buffered per connection
    #[arg(long, default_value_t = 64)]
    pub mailbox_capacity: usize,

    /// Inbound messages buffered ahead of the router
    #[arg(long, default_value_t = 256)]
    pub router_capacity: usize,

    /// Seconds a new connection has to send its display name
    #[arg(long, default_value_t = 30)]
    pub handshake_timeout_secs: u64,

    /// How long the router waits on a full mailbox before evicting
    #[arg(long, default_value_t = 250)]
    pub send_timeout_ms: u64,
}

/// Runtime knobs shared by every connection.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_line_len: usize,
    pub mailbox_capacity: usize,
    pub router_capacity: usize,
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_line_len: 4096,
            mailbox_capacity: 64,
            router_capacity: 256,
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_millis(250),
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            max_line_len: args.max_line_len,
            // zero-capacity channels panic in tokio
            mailbox_capacity: args.mailbox_capacity.max(1),
            router_capacity: args.router_capacity.max(1),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            send_timeout: Duration::from_millis(args.send_timeout_ms),
        }
    }
}
