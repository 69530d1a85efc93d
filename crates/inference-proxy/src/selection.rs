//! Prompt clean-up and prompt-length model tiers.

use serde::{Deserialize, Serialize};

/// Model used when a request carries nothing to size a tier on and no default
/// is configured.
pub const FALLBACK_MODEL: &str = "qwen2.5:3b";

/// Trims the prompt and, for very short prompts without a question mark,
/// appends one so tiny models answer instead of continuing the text.
pub fn normalize_prompt(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.chars().count() < 10 && !trimmed.contains('?') {
        format!("{trimmed}?")
    } else {
        trimmed.to_string()
    }
}

/// Prompts strictly shorter than `below_chars` characters use `model`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTier {
    pub below_chars: usize,
    pub model: String,
}

/// Ordered tier table plus the model for anything longer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelTiers {
    pub tiers: Vec<ModelTier>,
    pub longest: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        let tier = |below_chars, model: &str| ModelTier {
            below_chars,
            model: model.to_string(),
        };
        Self {
            tiers: vec![
                tier(20, "smollm2:135m"),
                tier(50, "gemma3:270m"),
                tier(100, "qwen3:1.7b"),
            ],
            longest: "qwen3:4b".to_string(),
        }
    }
}

impl ModelTiers {
    /// Pick the model for a prompt of `chars` characters.
    pub fn select(&self, chars: usize) -> &str {
        self.tiers
            .iter()
            .find(|t| chars < t.below_chars)
            .map(|t| t.model.as_str())
            .unwrap_or(&self.longest)
    }

    /// Every model named by the table, in tier order.
    pub fn models(&self) -> Vec<String> {
        self.tiers
            .iter()
            .map(|t| t.model.clone())
            .chain(std::iter::once(self.longest.clone()))
            .collect()
    }
}

/// How a chat request's model is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    /// Use exactly this model.
    Pinned(String),
    /// Size the model to the (normalised) prompt.
    Auto,
}

impl ModelChoice {
    /// Explicit request model first, then the configured default, then auto.
    /// Blank names count as absent.
    pub fn from_request(explicit: Option<&str>, configured_default: Option<&str>) -> Self {
        explicit
            .or(configured_default)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|m| Self::Pinned(m.to_string()))
            .unwrap_or(Self::Auto)
    }

    pub fn resolve(&self, tiers: &ModelTiers, prompt: &str) -> String {
        match self {
            Self::Pinned(model) => model.clone(),
            Self::Auto => tiers.select(prompt.chars().count()).to_string(),
        }
    }
}
