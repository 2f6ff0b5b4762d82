use std::error::Error;
use std::path::PathBuf;

use clap::{crate_version, Parser};
use libp2p::Multiaddr;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sharegrid::config::GridConfig;
use sharegrid::expiration;
use sharegrid::grid::GridClient;
use sharegrid::lease::{Clock, SystemClock};
use sharegrid::provider::dao;

#[derive(Debug, Parser)]
#[command(name = "gridnode")]
#[command(version = crate_version!())]
#[command(
    about = "gridnode - a node of a capability-secured storage grid",
    long_about = "A gridnode stores erasure-coded, encrypted shares of files for other nodes and uploads its own files across the grid. Files are found again through capability strings alone: the storage index inside a capability decides which servers are asked, in which order. When storage is enabled the node keeps shares in an embedded database under the node directory and reclaims shares whose leases have all expired, according to the [storage.expire] section of conf.toml."
)]
enum CliArgument {
    /// Create a node directory with a fresh identity key, root secret and default conf.toml.
    Init {
        /// Store shares for other nodes.
        #[clap(long)]
        storage: bool,

        /// Address the storage service listens on. Required with --storage.
        #[clap(long, short)]
        listen_address: Option<Multiaddr>,

        /// Human-readable node name.
        #[clap(long, short)]
        nickname: Option<String>,
    },
    /// Start the node and run until interrupted.
    Run,
    /// Run one expiration sweep over the local share store and print the report.
    Sweep {
        /// Print the report as JSON.
        #[clap(long)]
        json: bool,
    },
}

#[derive(Parser, Debug)]
#[clap(name = "gridnode")]
struct Opt {
    /// Node directory.
    #[clap(long, short, default_value = ".grid")]
    basedir: PathBuf,

    /// Subcommand to run.
    #[clap(subcommand)]
    argument: CliArgument,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let opt = Opt::parse();

    match opt.argument {
        CliArgument::Init {
            storage,
            listen_address,
            nickname,
        } => {
            GridConfig::init(&opt.basedir)?;
            let mut config = GridConfig::new(&opt.basedir)?;
            if let Some(nickname) = nickname {
                config.nickname = nickname;
            }
            config.storage.enabled = storage;
            if let Some(address) = listen_address {
                config.storage.listen_address = Some(address.to_string());
            }
            config.validate()?;
            config.save()?;
            // creates private/secret
            sharegrid::secret::SecretHolder::load_or_create(&config.private_dir())?;
            println!("node directory: {}", config.base_dir().display());
            println!("server id: {}", config.server_id()?);
        }

        CliArgument::Run => {
            let config = GridConfig::new(&opt.basedir)?;
            println!("server id: {}", config.server_id()?);
            let client = GridClient::start(config).await?;
            debug!("waiting for ctrl-c");
            tokio::signal::ctrl_c().await?;
            client.shutdown().await;
        }

        CliArgument::Sweep { json } => {
            let config = GridConfig::new(&opt.basedir)?;
            let settings = config.storage_settings()?;
            let store = dao(Some(&config.storage_dir().join("shares")))?;
            let report = expiration::sweep(store.as_ref(), &settings.expiration, SystemClock.now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
        }
    }

    Ok(())
}
