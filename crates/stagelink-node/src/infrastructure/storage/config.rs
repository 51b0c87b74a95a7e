//! TOML-based configuration persistence for the node.
//!
//! Reads and writes [`NodeConfig`] to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\StageLink\config.toml`
//! - Linux:    `~/.config/stagelink/config.toml`
//! - macOS:    `~/Library/Application Support/StageLink/config.toml`
//!
//! Every field carries a serde default, so an empty or partial file (the
//! normal case on first run and after upgrades) deserializes into a
//! working configuration.  The private key lives in this file too: trust
//! in this system is per-installation, and the config file already *is*
//! the installation's mutable state.  File permissions are the deployment
//! concern, not a separate key store.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use stagelink_core::{fingerprint, generate_keypair, KeyError, PairedMaster};

use crate::application::LocalIdentity;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The identity keypair could not be generated.
    #[error(transparent)]
    Keys(#[from] KeyError),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level node configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub display: DisplaySection,
    /// Trust records for every paired master.
    #[serde(default)]
    pub paired_masters: Vec<PairedMaster>,
}

/// General node behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// `"network"` or `"local"`.  Local mode disables discovery
    /// announce/browse; the pairing and command listeners stay up.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Name announced over discovery.  Filled from the hostname on first run.
    #[serde(default)]
    pub instance_name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// This instance's durable identity.  Generated on first run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IdentitySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
}

/// Peer discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Shared PIN for session bootstrap.  When set, this instance requires
    /// it on `/peer/socket-info` and presents it when calling masters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_pin: Option<String>,
}

/// Network port and bind-address settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// TCP port of the pairing HTTP server.
    #[serde(default = "default_pairing_port")]
    pub pairing_port: u16,
    /// TCP port of the WebSocket command hub.
    #[serde(default = "default_socket_port")]
    pub socket_port: u16,
    /// URL path the command hub accepts upgrades on.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    /// IP address to bind both listeners to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// How incoming presentation commands drive the local windows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplaySection {
    /// When `true`, `close-presentation` loads idle content instead of
    /// closing windows.
    #[serde(default)]
    pub keep_screens_open: bool,
    /// Whether presentations are mirrored onto additional screens.
    #[serde(default)]
    pub use_additional_screens: bool,
    /// Idle content shown in keep-screens-open mode.
    #[serde(default = "default_idle_url")]
    pub idle_url: String,
    #[serde(default = "default_true")]
    pub fullscreen: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_mode() -> String {
    "network".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_pairing_port() -> u16 {
    24890
}
fn default_socket_port() -> u16 {
    24891
}
fn default_socket_path() -> String {
    "/peer".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_idle_url() -> String {
    "about:blank".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            instance_name: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            pairing_pin: None,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            pairing_port: default_pairing_port(),
            socket_port: default_socket_port(),
            socket_path: default_socket_path(),
            bind_address: default_bind_address(),
        }
    }
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            keep_screens_open: false,
            use_additional_screens: false,
            idle_url: default_idle_url(),
            fullscreen: default_true(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config
/// base directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory
/// cannot be determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads [`NodeConfig`] from `path`, returning `NodeConfig::default()` if
/// the file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not
/// found", and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NodeConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &NodeConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the `StageLink`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        // %APPDATA% e.g. C:\Users\<user>\AppData\Roaming
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("StageLink"))
    }

    #[cfg(target_os = "linux")]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("stagelink"))
    }

    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/StageLink
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("StageLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Shared settings store ─────────────────────────────────────────────────────

/// Shared handle to the node's settings.  Mutations made through
/// [`update`](Self::update) are written to disk before returning, so the
/// file is always at least as new as what any reader has seen.
pub struct SettingsStore {
    path: PathBuf,
    config: RwLock<NodeConfig>,
}

impl SettingsStore {
    /// Loads (or defaults) the config stored at `path`.
    ///
    /// # Errors
    ///
    /// Propagates [`load_config`] failures.
    pub fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let config = load_config(&path)?;
        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    /// Loads from the platform default location.
    ///
    /// # Errors
    ///
    /// Propagates [`config_file_path`] and [`load_config`] failures.
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::load(config_file_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone of the current configuration.
    pub fn snapshot(&self) -> NodeConfig {
        self.config.read().unwrap().clone()
    }

    /// Mutates the configuration and persists it.
    ///
    /// # Errors
    ///
    /// Returns the save error.  The in-memory change is kept either way;
    /// the next successful update writes it out.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut NodeConfig) -> R) -> Result<R, ConfigError> {
        let mut config = self.config.write().unwrap();
        let result = mutate(&mut config);
        save_config(&self.path, &config)?;
        Ok(result)
    }

    /// Mutates the in-memory configuration without persisting, for
    /// command-line overrides.  Note that any later [`update`](Self::update)
    /// writes the whole config, overrides included.
    pub fn apply(&self, mutate: impl FnOnce(&mut NodeConfig)) {
        let mut config = self.config.write().unwrap();
        mutate(&mut config);
    }
}

/// Loads this instance's identity from `settings`, generating and
/// persisting a fresh one on first run.  The instance name falls back to
/// the machine hostname when the config does not name one.
///
/// # Errors
///
/// Returns [`ConfigError::Keys`] if keypair generation fails and the
/// usual persistence errors if the new identity cannot be saved.
pub fn ensure_identity(settings: &SettingsStore) -> Result<LocalIdentity, ConfigError> {
    let snapshot = settings.snapshot();
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let instance_name = if snapshot.node.instance_name.is_empty() {
        hostname.clone()
    } else {
        snapshot.node.instance_name.clone()
    };

    if let (Some(instance_id), Some(public_key_pem), Some(private_key_pem)) = (
        snapshot.identity.instance_id,
        snapshot.identity.public_key_pem,
        snapshot.identity.private_key_pem,
    ) {
        return Ok(LocalIdentity {
            instance_id,
            instance_name,
            hostname,
            public_key_pem,
            private_key_pem,
        });
    }

    info!("no identity on file, generating an RSA-2048 keypair");
    let keypair = generate_keypair()?;
    let instance_id = snapshot.identity.instance_id.unwrap_or_else(Uuid::new_v4);
    settings.update(|config| {
        config.identity.instance_id = Some(instance_id);
        config.identity.public_key_pem = Some(keypair.public_key_pem.clone());
        config.identity.private_key_pem = Some(keypair.private_key_pem.clone());
        if config.node.instance_name.is_empty() {
            config.node.instance_name = instance_name.clone();
        }
    })?;
    info!(
        "instance identity created: {instance_id}, key fingerprint {}",
        fingerprint(&keypair.public_key_pem)
    );
    Ok(LocalIdentity {
        instance_id,
        instance_name,
        hostname,
        public_key_pem: keypair.public_key_pem,
        private_key_pem: keypair.private_key_pem,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
