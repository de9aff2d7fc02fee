//! Layered configuration: built-in defaults, overridden by an optional TOML
//! file, overridden by `FOCUS_`-prefixed environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FocusConfig {
  pub xmpp: XmppConfig,
  pub bridge: BridgeConfig,
  pub admission: AdmissionConfig,
  #[serde(default)]
  pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XmppConfig {
  pub websocket_url: String,
  pub domain: String,
  pub muc_domain: String,
  pub focus_jid: String,
  pub username: String,
  #[serde(default)]
  pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
  /// Version-pin expiry, in seconds.
  #[serde(default = "BridgeConfig::default_pin_ttl_secs")]
  pub pin_ttl_secs: u64,
  /// Maximum participants a single bridge is allowed before it is considered stressed.
  #[serde(default = "BridgeConfig::default_max_participants")]
  pub max_participants_per_bridge: u32,
}

impl BridgeConfig {
  fn default_pin_ttl_secs() -> u64 {
    60 * 60 * 24
  }

  fn default_max_participants() -> u32 {
    100
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
  /// "xmpp-domain" (trust the XMPP server's authentication) or "external" (validate a bearer token).
  pub mode: AdmissionMode,
  #[serde(default)]
  pub reservation_base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionMode {
  XmppDomain,
  External,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
  #[serde(default = "HttpConfig::default_bind")]
  pub bind: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    HttpConfig { bind: HttpConfig::default_bind() }
  }
}

impl HttpConfig {
  fn default_bind() -> String {
    "0.0.0.0:8888".to_owned()
  }
}

impl FocusConfig {
  /// Load defaults, then an optional file at `path`, then `FOCUS_*` environment overrides.
  pub fn load(path: Option<&str>) -> Result<FocusConfig> {
    let defaults = format!(
      "[bridge]\npin_ttl_secs = {}\nmax_participants_per_bridge = {}\n[http]\nbind = \"{}\"\n",
      BridgeConfig::default_pin_ttl_secs(),
      BridgeConfig::default_max_participants(),
      HttpConfig::default_bind(),
    );
    let mut builder = config::Config::builder()
      .add_source(config::File::from_str(&defaults, config::FileFormat::Toml));
    if let Some(path) = path {
      builder = builder.add_source(config::File::with_name(path));
    }
    builder = builder.add_source(config::Environment::with_prefix("FOCUS").separator("__"));
    builder
      .build()
      .context("loading configuration")?
      .try_deserialize()
      .context("deserializing configuration")
  }
}
