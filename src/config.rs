use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use config::{Config, Environment, File};
use libp2p::identity::Keypair;
use libp2p::Multiaddr;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{
    DEFAULT_LEASE_DURATION_SECONDS, DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_SHARES_HAPPY,
    DEFAULT_SHARES_NEEDED, DEFAULT_SHARES_TOTAL, DEFAULT_SWEEP_SECONDS, GIB, KIB, MIB, TIB,
};
use crate::error::{GridError, Result};
use crate::expiration::{ExpirationMode, ExpirationPolicy};
use crate::hashutil;
use crate::ring::ServerId;
use crate::server::StorageSettings;
use crate::upload::EncodingParameters;

const CONF_FILE: &str = "conf.toml";
const KEY_FILE: &str = "key";
const PRIVATE_DIR: &str = "private";
const SERVERS_FILE: &str = "servers.toml";
const SEED_FILE: &str = "permutation-seed";
const ENV_PREFIX: &str = "GRID";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Parses an abbreviated size such as `"10G"`, `"500MB"`, `"2KiB"` or `"0"`.
///
/// Decimal suffixes are powers of 1000; an `i` makes them powers of 1024.
///
/// # Examples
///
/// ```rust
/// use sharegrid::config::parse_size;
///
/// assert_eq!(parse_size("10k").unwrap(), 10_000);
/// assert_eq!(parse_size("2KiB").unwrap(), 2048);
/// assert_eq!(parse_size("1G").unwrap(), 1_000_000_000);
/// ```
pub fn parse_size(text: &str) -> Result<u64> {
    let bad = || GridError::configuration("size", format!("cannot parse {text:?}"));
    let upper = text.trim().to_ascii_uppercase();
    let mut rest = upper.strip_suffix('B').unwrap_or(&upper);
    let binary = rest.ends_with('I');
    if binary {
        rest = &rest[..rest.len() - 1];
    }
    let digits = rest.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let suffix = rest[digits.len()..].trim();
    let number: u64 = digits.trim().parse().map_err(|_| bad())?;
    let multiplier = match (suffix, binary) {
        ("", false) => 1,
        ("K", false) => 1_000,
        ("M", false) => 1_000_000,
        ("G", false) => 1_000_000_000,
        ("T", false) => 1_000_000_000_000,
        ("K", true) => KIB,
        ("M", true) => MIB,
        ("G", true) => GIB,
        ("T", true) => TIB,
        _ => return Err(bad()),
    };
    number.checked_mul(multiplier).ok_or_else(bad)
}

/// Parses a duration such as `"31 days"`, `"2 months"`, `"12h"` or `"3600"`
/// into seconds. A month is 31 days and a year 365.
pub fn parse_duration(text: &str) -> Result<u64> {
    let bad = || GridError::configuration("duration", format!("cannot parse {text:?}"));
    let text = text.trim().to_ascii_lowercase();
    let digits = text.trim_end_matches(|c: char| !c.is_ascii_digit());
    let number: u64 = digits.trim().parse().map_err(|_| bad())?;
    let unit = match text[digits.len()..].trim() {
        "" | "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" | "minute" | "minutes" => MINUTE,
        "h" | "hour" | "hours" => HOUR,
        "d" | "day" | "days" => DAY,
        "month" | "months" => 31 * DAY,
        "y" | "year" | "years" => 365 * DAY,
        _ => return Err(bad()),
    };
    number.checked_mul(unit).ok_or_else(bad)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub shares_needed: usize,
    pub shares_happy: usize,
    pub shares_total: usize,
    pub max_segment_size: usize,
    pub peers_preferred: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutable_keysize: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            shares_needed: DEFAULT_SHARES_NEEDED,
            shares_happy: DEFAULT_SHARES_HAPPY,
            shares_total: DEFAULT_SHARES_TOTAL,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            peers_preferred: vec![],
            mutable_keysize: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpireConfig {
    pub enabled: bool,
    /// `"age"` or `"cutoff-date"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_lease_duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cutoff_date: Option<String>,
    pub immutable: bool,
    pub mutable: bool,
}

impl Default for ExpireConfig {
    fn default() -> Self {
        ExpireConfig {
            enabled: false,
            mode: None,
            override_lease_duration: None,
            cutoff_date: None,
            immutable: true,
            mutable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
    /// Defaults to `<basedir>/storage`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    pub readonly: bool,
    pub reserved_space: String,
    pub debug_discard: bool,
    pub lease_duration: String,
    pub sweep_interval: String,
    pub expire: ExpireConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            enabled: false,
            listen_address: None,
            storage_dir: None,
            readonly: false,
            reserved_space: "0".to_string(),
            debug_discard: false,
            lease_duration: format!("{} days", DEFAULT_LEASE_DURATION_SECONDS / DAY),
            sweep_interval: format!("{}", DEFAULT_SWEEP_SECONDS),
            expire: ExpireConfig::default(),
        }
    }
}

/// Node configuration, read from `<basedir>/conf.toml` and overridden by
/// `GRID_`-prefixed environment variables, with `__` between nested keys
/// (`GRID_CLIENT__SHARES_HAPPY=5`).
///
/// # Fields
///
/// * `base_dir` - The node directory; not part of the file.
/// * `nickname` - Human-readable node name.
/// * `client` - Encoding parameters and peer preferences.
/// * `storage` - Whether and how this node stores shares for others.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    #[serde(skip)]
    base_dir: PathBuf,
    pub nickname: String,
    pub client: ClientConfig,
    pub storage: StorageConfig,
}

impl GridConfig {
    /// Loads the node directory at `path`, creating it with a fresh identity
    /// key and a default `conf.toml` on first use.
    ///
    /// # Returns
    ///
    /// A `Configuration` error if the merged settings are inconsistent.
    pub fn new(path: &Path) -> Result<Self> {
        let created = Self::init(path)?;
        if created {
            info!("initialised node directory {:?}", path);
        }
        let base_dir = path.canonicalize()?;
        debug!("loading config from {:?}", base_dir);

        let settings = Config::builder()
            .add_source(File::with_name(&base_dir.join(CONF_FILE).to_string_lossy()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let mut config: GridConfig = settings.try_deserialize()?;
        config.base_dir = base_dir;
        config.validate()?;
        Ok(config)
    }

    /// Writes the identity key and default `conf.toml` where missing.
    ///
    /// # Returns
    ///
    /// Whether anything was created.
    pub fn init(path: &Path) -> Result<bool> {
        let mut created = false;
        fs::create_dir_all(path.join(PRIVATE_DIR))?;

        let key_path = path.join(KEY_FILE);
        if !key_path.exists() {
            let encoded = Keypair::generate_ed25519()
                .to_protobuf_encoding()
                .map_err(|e| GridError::Crypto(e.to_string()))?;
            fs::write(&key_path, hex::encode(encoded))?;
            created = true;
        }

        let conf_path = path.join(CONF_FILE);
        if !conf_path.exists() {
            fs::write(&conf_path, toml::to_string_pretty(&GridConfig::default())?)?;
            created = true;
        }
        Ok(created)
    }

    /// Writes these settings back to `<basedir>/conf.toml`.
    pub fn save(&self) -> Result<()> {
        fs::write(self.base_dir.join(CONF_FILE), toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn private_dir(&self) -> PathBuf {
        self.base_dir.join(PRIVATE_DIR)
    }

    pub fn static_servers_path(&self) -> PathBuf {
        self.private_dir().join(SERVERS_FILE)
    }

    pub fn storage_dir(&self) -> PathBuf {
        match &self.storage.storage_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.base_dir.join(dir),
            None => self.base_dir.join("storage"),
        }
    }

    /// The node identity key.
    pub fn key(&self) -> Result<Keypair> {
        let encoded = fs::read_to_string(self.base_dir.join(KEY_FILE))?;
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| GridError::configuration("key", e.to_string()))?;
        Keypair::from_protobuf_encoding(&bytes).map_err(|e| GridError::configuration("key", e.to_string()))
    }

    pub fn server_id(&self) -> Result<ServerId> {
        Ok(ServerId::from_peer_id(self.key()?.public().to_peer_id()))
    }

    pub fn encoding_parameters(&self) -> Result<EncodingParameters> {
        EncodingParameters::new(
            self.client.shares_needed,
            self.client.shares_happy,
            self.client.shares_total,
            self.client.max_segment_size,
        )
    }

    pub fn preferred_peers(&self) -> Result<Vec<ServerId>> {
        self.client
            .peers_preferred
            .iter()
            .map(|p| {
                ServerId::from_str(p)
                    .map_err(|_| GridError::configuration("client.peers_preferred", format!("bad server id {p:?}")))
            })
            .collect()
    }

    pub fn listen_address(&self) -> Result<Option<Multiaddr>> {
        self.storage
            .listen_address
            .as_deref()
            .map(|a| {
                Multiaddr::from_str(a)
                    .map_err(|e| GridError::configuration("storage.listen_address", e.to_string()))
            })
            .transpose()
    }

    pub fn sweep_interval(&self) -> Result<u64> {
        let seconds = parse_duration(&self.storage.sweep_interval)
            .map_err(|_| GridError::configuration("storage.sweep_interval", "not a duration"))?;
        if seconds == 0 {
            return Err(GridError::configuration("storage.sweep_interval", "must be positive"));
        }
        Ok(seconds)
    }

    pub fn expiration_policy(&self) -> Result<ExpirationPolicy> {
        let expire = &self.storage.expire;
        let mode = match expire.mode.as_deref() {
            None if expire.enabled => {
                return Err(GridError::configuration("storage.expire.mode", "required when expiration is enabled"))
            }
            None | Some("age") => ExpirationMode::Age {
                override_lease_duration: expire
                    .override_lease_duration
                    .as_deref()
                    .map(parse_duration)
                    .transpose()
                    .map_err(|_| GridError::configuration("storage.expire.override_lease_duration", "not a duration"))?,
            },
            Some("cutoff-date") => {
                let date = expire.cutoff_date.as_deref().ok_or_else(|| {
                    GridError::configuration("storage.expire.cutoff_date", "required in cutoff-date mode")
                })?;
                ExpirationMode::cutoff_from_date(date)
                    .map_err(|_| GridError::configuration("storage.expire.cutoff_date", format!("bad date {date:?}")))?
            }
            Some(other) => {
                return Err(GridError::configuration(
                    "storage.expire.mode",
                    format!("{other:?} is neither \"age\" nor \"cutoff-date\""),
                ))
            }
        };
        Ok(ExpirationPolicy {
            enabled: expire.enabled,
            mode,
            immutable: expire.immutable,
            mutable: expire.mutable,
        })
    }

    pub fn storage_settings(&self) -> Result<StorageSettings> {
        if self.storage.debug_discard && !cfg!(feature = "debug-discard") {
            return Err(GridError::configuration(
                "storage.debug_discard",
                "this build has no debug-discard support",
            ));
        }
        Ok(StorageSettings {
            readonly: self.storage.readonly,
            reserved_space: parse_size(&self.storage.reserved_space)
                .map_err(|_| GridError::configuration("storage.reserved_space", "not a size"))?,
            lease_duration: parse_duration(&self.storage.lease_duration)
                .map_err(|_| GridError::configuration("storage.lease_duration", "not a duration"))?,
            expiration: self.expiration_policy()?,
            #[cfg(any(test, feature = "debug-discard"))]
            discard_storage: self.storage.debug_discard,
        })
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        self.encoding_parameters()?;
        self.preferred_peers()?;
        let address = self.listen_address()?;
        if self.storage.enabled {
            if address.is_none() {
                return Err(GridError::configuration(
                    "storage.listen_address",
                    "required when storage is enabled",
                ));
            }
            self.storage_settings()?;
            self.sweep_interval()?;
        }
        Ok(())
    }

    /// The seed this node announces for ring permutation.
    ///
    /// Read from `<basedir>/permutation-seed`. A node created before seeds
    /// existed, recognisable by already holding shares, keeps its server id
    /// as the seed so its shares stay where readers look for them. Any other
    /// node gets a random seed. The choice is written back either way.
    pub fn permutation_seed(&self, has_shares: bool) -> Result<Vec<u8>> {
        let path = self.base_dir.join(SEED_FILE);
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            return hashutil::a2b(text.trim())
                .map_err(|e| GridError::configuration(SEED_FILE, e.to_string()));
        }
        let seed = if has_shares {
            info!("storage already holds shares, using the server id as permutation seed");
            self.server_id()?.to_bytes()
        } else {
            let mut seed = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            seed
        };
        fs::write(&path, format!("{}\n", hashutil::b2a(&seed)))?;
        Ok(seed)
    }
}
