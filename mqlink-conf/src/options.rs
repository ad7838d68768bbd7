use structopt::StructOpt;

use crate::Mode;

#[derive(StructOpt, Debug, Clone, Default)]
#[structopt(name = "mqlink-bench", about = "MQTT v5 client throughput benchmark")]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Broker address, host:port
    #[structopt(name = "addr", short = "a", long)]
    pub addr: Option<String>,

    /// Benchmark mode, publisher or subscriber
    #[structopt(name = "mode", short = "m", long)]
    pub mode: Option<Mode>,

    /// Number of messages to send or receive
    #[structopt(name = "messages", short = "n", long)]
    pub messages: Option<usize>,

    /// QoS of the published messages, 0 or 1
    #[structopt(name = "qos", short = "q", long)]
    pub qos: Option<u8>,

    /// Client identifier
    #[structopt(name = "client-id", short = "i", long)]
    pub client_id: Option<String>,
}
