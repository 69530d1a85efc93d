use clap::builder::BoolishValueParser;
use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "quicpair-gateway",
    version,
    about = "Secure local gateway between WebRTC peers and an Ollama backend"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Ollama base URL (overrides config file setting)
    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Model used when a chat does not name one
    #[arg(long, env = "OLLAMA_MODEL")]
    pub model: Option<String>,

    /// TURN relay URL
    #[arg(long, env = "TURN_URLS")]
    pub turn_url: Option<String>,

    /// TURN username
    #[arg(long, env = "TURN_USER")]
    pub turn_user: Option<String>,

    /// TURN credential
    #[arg(long, env = "TURN_PASS", hide_env_values = true)]
    pub turn_pass: Option<String>,

    /// Admit callers from outside the local network
    #[arg(long, env = "DISABLE_STRICT_LOCAL", value_parser = BoolishValueParser::new())]
    pub disable_strict_local: bool,

    /// Enable development switches
    #[arg(long, env = "DEV_MODE", value_parser = BoolishValueParser::new())]
    pub dev_mode: bool,

    /// Let peers chat before the Noise handshake (needs --dev-mode)
    #[cfg(debug_assertions)]
    #[arg(long, env = "DEV_ALLOW_PLAINTEXT", value_parser = BoolishValueParser::new())]
    pub dev_allow_plaintext: bool,

    /// Log level used when RUST_LOG is unset (overrides config file setting)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    /// Merge command-line and environment overrides into `cfg`.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(ref listen) = self.listen {
            cfg.network.listen_addr = listen.clone();
        }
        if self.disable_strict_local {
            cfg.network.strict_local = false;
        }
        if let Some(ref url) = self.ollama_url {
            cfg.backend.url = url.clone();
        }
        if let Some(ref model) = self.model {
            cfg.backend.default_model = Some(model.clone());
        }
        if let Some(ref url) = self.turn_url {
            cfg.rtc.turn.urls = vec![url.clone()];
        }
        if let Some(ref user) = self.turn_user {
            cfg.rtc.turn.username = user.clone();
        }
        if let Some(ref pass) = self.turn_pass {
            cfg.rtc.turn.credential = pass.clone();
        }
        if self.dev_mode {
            cfg.dev.enabled = true;
        }
        #[cfg(debug_assertions)]
        if self.dev_allow_plaintext {
            cfg.dev.allow_plaintext = true;
        }
        if let Some(ref level) = self.log_level {
            cfg.logging.level = level.clone();
        }
    }
}
