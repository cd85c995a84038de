//! Proxy configuration module
//!
//! Parses and manages proxy configuration from YAML files.
//!
//! Uses serde_yaml for parsing - define the struct, serde handles
//! the parsing and type conversion, `validate()` handles the rest.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Maximum number of optional packs a deployment may register
pub const OPTIONAL_PACKS_MAX: usize = 64;

/// Compression scheme negotiated with front clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionScheme {
    Zlib,
    None,
}

/// How the proxy proves player identity to the backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Backend trusts any username
    Offline,
    /// Players authenticate against the account service before joining
    Online,
    /// Identity is forwarded in the handshake suffix under a shared key
    Floodgate,
}

/// Category a pack is offered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackCategory {
    Resource,
    Behavior,
}

/// Front (client-facing) listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockConfig {
    #[serde(default = "default_bind_address")]
    pub address: String,

    #[serde(default = "default_bedrock_port")]
    pub port: u16,

    #[serde(default = "default_motd")]
    pub motd: String,

    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_compression")]
    pub compression: CompressionScheme,

    /// Present the nether as the end dimension so clients can build above
    /// y=128; nether fog is applied by hand instead
    #[serde(default)]
    pub above_bedrock_nether_building: bool,
}

impl Default for BedrockConfig {
    fn default() -> Self {
        Self {
            address: default_bind_address(),
            port: default_bedrock_port(),
            motd: default_motd(),
            server_name: default_server_name(),
            compression: default_compression(),
            above_bedrock_nether_building: false,
        }
    }
}

/// Backend (server-facing) connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub address: String,

    #[serde(default = "default_remote_port")]
    pub port: u16,

    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,

    /// Prefix the backend connection with a PROXY protocol v1 header
    #[serde(default)]
    pub use_proxy_protocol: bool,

    /// Use the host the client dialed instead of `address` in the handshake
    #[serde(default)]
    pub forward_host: bool,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// One pack offered to every client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackEntryConfig {
    pub path: String,

    #[serde(default = "default_pack_category")]
    pub category: PackCategory,

    /// Stable pack id; derived from the content hash when omitted
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default = "default_pack_version")]
    pub version: String,
}

/// A pack players can opt into by numeric id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionalPackConfig {
    pub number: u32,
    pub id: String,
    pub path: String,

    #[serde(default = "default_pack_version")]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionalPacksConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub packs: Vec<OptionalPackConfig>,
}

/// Main proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    // ============================================
    // Listeners
    // ============================================
    #[serde(default)]
    pub bedrock: BedrockConfig,

    pub remote: RemoteConfig,

    // ============================================
    // Identity & Security
    // ============================================
    /// Reject identity chains that are not rooted in a trusted key
    #[serde(default = "default_online_mode")]
    pub online_mode: bool,

    /// Base64 Ed25519 verifying keys accepted as chain roots
    #[serde(default)]
    pub trusted_root_keys: Vec<String>,

    /// Base64 32-byte key sealing the forwarded identity (floodgate only)
    #[serde(default)]
    pub floodgate_key: Option<String>,

    // ============================================
    // Packs
    // ============================================
    #[serde(default)]
    pub force_resource_packs: bool,

    #[serde(default)]
    pub packs: Vec<PackEntryConfig>,

    #[serde(default)]
    pub optional_packs: OptionalPacksConfig,

    /// Stable player id -> comma separated optional pack numbers
    #[serde(default)]
    pub player_optional_packs: HashMap<String, String>,

    // ============================================
    // Authentication
    // ============================================
    /// Players allowed to reuse a stored refresh token
    #[serde(default)]
    pub saved_user_logins: Vec<String>,

    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,

    #[serde(default = "default_pending_auth_timeout")]
    pub pending_authentication_timeout_secs: u64,

    // ============================================
    // Misc
    // ============================================
    #[serde(default = "default_max_players")]
    pub max_players: usize,

    #[serde(default)]
    pub log_player_ip_addresses: bool,

    #[serde(default)]
    pub lang_file: Option<String>,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bedrock_port() -> u16 {
    19132
}

fn default_motd() -> String {
    "Crossplay".to_string()
}

fn default_server_name() -> String {
    "Crossplay".to_string()
}

fn default_compression() -> CompressionScheme {
    CompressionScheme::Zlib
}

fn default_remote_port() -> u16 {
    25565
}

fn default_auth_type() -> AuthType {
    AuthType::Online
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_pack_category() -> PackCategory {
    PackCategory::Resource
}

fn default_pack_version() -> String {
    "1.0.0".to_string()
}

fn default_online_mode() -> bool {
    true
}

fn default_credentials_file() -> String {
    "./saved-refresh-tokens.yaml".to_string()
}

fn default_pending_auth_timeout() -> u64 {
    120
}

fn default_max_players() -> usize {
    100
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use crossplay::config::ProxyConfig;
    ///
    /// let config = ProxyConfig::from_file("conf/proxy.yaml")
    ///     .expect("Failed to load config");
    /// println!("Backend: {}:{}", config.remote.address, config.remote.port);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ProxyConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    ///
    /// Useful for testing
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.remote.address.is_empty(), "remote.address cannot be empty");
        anyhow::ensure!(self.max_players > 0, "max_players must be at least 1");
        anyhow::ensure!(
            self.remote.connect_timeout_secs > 0,
            "remote.connect_timeout_secs must be at least 1"
        );

        anyhow::ensure!(
            self.optional_packs.packs.len() <= OPTIONAL_PACKS_MAX,
            "Too many optional packs: {} (max {})",
            self.optional_packs.packs.len(),
            OPTIONAL_PACKS_MAX
        );

        if self.online_mode {
            anyhow::ensure!(
                !self.trusted_root_keys.is_empty(),
                "online_mode requires at least one trusted_root_keys entry"
            );
        }

        if self.remote.auth_type == AuthType::Floodgate {
            anyhow::ensure!(
                self.floodgate_key.is_some(),
                "auth_type floodgate requires floodgate_key"
            );
        }

        Ok(())
    }

    /// Save configuration to a YAML file
    ///
    /// Useful for generating config templates
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Optional pack numbers the given player opted into
    pub fn optional_pack_numbers(&self, stable_id: &str) -> Vec<u32> {
        if !self.optional_packs.enabled {
            return Vec::new();
        }
        self.player_optional_packs
            .get(stable_id)
            .map(|list| {
                list.split(',')
                    .filter_map(|n| n.trim().parse::<u32>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to create a minimal valid config
    fn minimal_config() -> &'static str {
        r#"
remote:
  address: "127.0.0.1"
  auth_type: offline

online_mode: false
"#
    }

    #[test]
    fn test_minimal_config() {
        let config = ProxyConfig::from_str(minimal_config()).unwrap();

        assert_eq!(config.remote.address, "127.0.0.1");
        assert_eq!(config.remote.auth_type, AuthType::Offline);
        assert!(!config.online_mode);
    }

    #[test]
    fn test_default_values() {
        let config = ProxyConfig::from_str(minimal_config()).unwrap();

        assert_eq!(config.bedrock.port, 19132);
        assert_eq!(config.bedrock.address, "0.0.0.0");
        assert_eq!(config.bedrock.compression, CompressionScheme::Zlib);
        assert_eq!(config.remote.port, 25565);
        assert_eq!(config.remote.connect_timeout_secs, 10);
        assert_eq!(config.pending_authentication_timeout_secs, 120);
        assert_eq!(config.max_players, 100);
        assert!(!config.force_resource_packs);
        assert!(config.packs.is_empty());
    }

    #[test]
    fn test_online_mode_requires_root_key() {
        let config_str = r#"
remote:
  address: "127.0.0.1"
"#;
        let result = ProxyConfig::from_str(config_str);
        assert!(result.is_err());
    }

    #[test]
    fn test_floodgate_requires_key() {
        let config_str = r#"
remote:
  address: "127.0.0.1"
  auth_type: floodgate
online_mode: false
"#;
        assert!(ProxyConfig::from_str(config_str).is_err());
    }

    #[test]
    fn test_empty_remote_address_rejected() {
        let config_str = r#"
remote:
  address: ""
online_mode: false
"#;
        assert!(ProxyConfig::from_str(config_str).is_err());
    }

    #[test]
    fn test_packs_parse() {
        let config_str = r#"
remote:
  address: "127.0.0.1"
online_mode: false
packs:
  - path: "packs/textures.mcpack"
  - path: "packs/logic.mcpack"
    category: behavior
    version: "2.1.0"
"#;
        let config = ProxyConfig::from_str(config_str).unwrap();
        assert_eq!(config.packs.len(), 2);
        assert_eq!(config.packs[0].category, PackCategory::Resource);
        assert_eq!(config.packs[0].version, "1.0.0");
        assert_eq!(config.packs[1].category, PackCategory::Behavior);
        assert_eq!(config.packs[1].version, "2.1.0");
    }

    #[test]
    fn test_optional_pack_numbers() {
        let config_str = r#"
remote:
  address: "127.0.0.1"
online_mode: false
optional_packs:
  enabled: true
player_optional_packs:
  "1234": "1, 3,x,7"
"#;
        let config = ProxyConfig::from_str(config_str).unwrap();
        assert_eq!(config.optional_pack_numbers("1234"), vec![1, 3, 7]);
        assert!(config.optional_pack_numbers("9999").is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let config = ProxyConfig::from_str(minimal_config()).unwrap();

        let temp_path = std::env::temp_dir().join("crossplay_test_config.yaml");
        config.save(&temp_path).unwrap();

        let loaded = ProxyConfig::from_file(&temp_path).unwrap();
        assert_eq!(config.remote.address, loaded.remote.address);
        assert_eq!(config.bedrock.port, loaded.bedrock.port);

        let _ = std::fs::remove_file(temp_path);
    }
}
