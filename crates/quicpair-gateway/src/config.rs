use inference_proxy::ModelTiers;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub rtc: RtcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dev: DevConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    /// Refuse callers, origins and backend URLs outside the local network.
    #[serde(default = "default_true")]
    pub strict_local: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            strict_local: default_true(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    /// Model for data-channel chats that do not name one. Unset means the
    /// prompt-length tiers decide.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Models warmed up in the background at startup.
    #[serde(default = "default_warmup_models")]
    pub warmup_models: Vec<String>,
    #[serde(default)]
    pub tiers: ModelTiers,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            default_model: None,
            warmup_models: default_warmup_models(),
            tiers: ModelTiers::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RtcConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn: TurnConfig,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn: TurnConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DevConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Only honoured by debug builds, and only together with `enabled`.
    #[serde(default)]
    pub allow_plaintext: bool,
}

impl DevConfig {
    /// Whether peers may chat before completing the handshake.
    pub fn plaintext_allowed(&self) -> bool {
        cfg!(debug_assertions) && self.enabled && self.allow_plaintext
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_backend_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_warmup_models() -> Vec<String> {
    ModelTiers::default().models()
}

fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted, so the gateway starts with sensible defaults when no
/// config file has been written yet.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&dir.path().join("absent.yaml")).unwrap();

        assert_eq!(cfg.network.listen_addr, "0.0.0.0:8443");
        assert!(cfg.network.strict_local);
        assert_eq!(cfg.backend.url, "http://127.0.0.1:11434");
        assert_eq!(cfg.backend.default_model, None);
        assert_eq!(
            cfg.backend.warmup_models,
            vec!["smollm2:135m", "gemma3:270m", "qwen3:1.7b", "qwen3:4b"]
        );
        assert_eq!(cfg.rtc.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(cfg.rtc.turn.urls.is_empty());
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.dev.plaintext_allowed());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  strict_local: false\nbackend:\n  default_model: qwen2.5:3b\n  warmup_models: []\nrtc:\n  turn:\n    urls: [\"turn:10.0.0.2:3478\"]\n    username: u\n    credential: p"
        )
        .unwrap();

        let cfg = load(file.path()).unwrap();
        assert!(!cfg.network.strict_local);
        assert_eq!(cfg.network.listen_addr, "0.0.0.0:8443");
        assert_eq!(cfg.backend.default_model.as_deref(), Some("qwen2.5:3b"));
        assert!(cfg.backend.warmup_models.is_empty());
        assert_eq!(cfg.backend.url, "http://127.0.0.1:11434");
        assert_eq!(cfg.rtc.turn.urls, vec!["turn:10.0.0.2:3478"]);
        assert_eq!(cfg.rtc.turn.credential, "p");
        assert_eq!(cfg.rtc.stun_urls.len(), 1);
    }

    #[test]
    fn tiers_can_be_replaced() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "backend:\n  tiers:\n    tiers:\n      - below_chars: 30\n        model: tiny\n    longest: big"
        )
        .unwrap();

        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.backend.tiers.select(5), "tiny");
        assert_eq!(cfg.backend.tiers.select(500), "big");
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network: [unclosed").unwrap();
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn plaintext_needs_dev_mode() {
        let dev = DevConfig {
            enabled: false,
            allow_plaintext: true,
        };
        assert!(!dev.plaintext_allowed());

        let dev = DevConfig {
            enabled: true,
            allow_plaintext: true,
        };
        assert_eq!(dev.plaintext_allowed(), cfg!(debug_assertions));
    }
}
