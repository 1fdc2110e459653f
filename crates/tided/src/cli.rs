//! Command-line arguments for `tided`.

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use tiderun::registration::RegistrationConfig;
use tidewire::Compression;
use tidewire::Serialization;

/// Demo server and client for the tide RPC framework
#[derive(Parser, Debug)]
#[command(name = "tided")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the `A` service until interrupted
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8889")]
        listen: String,

        /// Per-frame read timeout in seconds
        #[arg(long, default_value_t = 10)]
        read_timeout: u64,

        /// Per-response write timeout in seconds
        #[arg(long, default_value_t = 10)]
        write_timeout: u64,

        /// Report idle CPU from /proc/stat, sampled every N seconds
        #[arg(long)]
        cpu_sample: Option<u64>,

        #[command(flatten)]
        etcd: EtcdArgs,

        /// Backend key to register, `network@host:port` (defaults to `tcp@<listen>`)
        #[arg(long)]
        advertise: Option<String>,
    },

    /// Call `A.Add` once on a running server, or on one discovered through etcd
    Call {
        /// Backend key, `network@host:port`
        #[arg(short, long, default_value = "tcp@127.0.0.1:8889")]
        addr: String,

        #[command(flatten)]
        etcd: EtcdArgs,

        /// Argument to add one to
        #[arg(default_value_t = 41)]
        arg: i64,

        /// Payload serialization
        #[arg(long, value_enum, default_value_t = Codec::Msgpack)]
        codec: Codec,

        /// Send payloads uncompressed
        #[arg(long)]
        no_gzip: bool,

        /// Call deadline in milliseconds
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
    },

    /// Run registered servers and a discovering client in one process
    Demo {
        /// Number of servers to start
        #[arg(short, long, default_value_t = 2)]
        servers: usize,

        /// Number of calls to spread across them
        #[arg(short, long, default_value_t = 6)]
        calls: usize,

        /// Pick backends at random instead of in turn
        #[arg(long)]
        random: bool,
    },
}

/// Registration and discovery through an etcd cluster
#[derive(Args, Debug, Clone)]
pub struct EtcdArgs {
    /// etcd endpoints, comma separated (requires the `etcd` feature)
    #[arg(long, value_delimiter = ',')]
    pub etcd: Vec<String>,

    /// Key prefix servers register under
    #[arg(long, default_value = RegistrationConfig::DEFAULT_BASE_PATH)]
    pub base_path: String,
}

impl EtcdArgs {
    pub fn enabled(&self) -> bool {
        !self.etcd.is_empty()
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Codec {
    Json,
    Msgpack,
}

impl Codec {
    pub fn serialization(self) -> Serialization {
        match self {
            Codec::Json => Serialization::JSON,
            Codec::Msgpack => Serialization::MSGPACK,
        }
    }
}

pub fn compression(no_gzip: bool) -> Compression {
    if no_gzip { Compression::NONE } else { Compression::GZIP }
}
