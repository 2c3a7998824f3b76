//! Model Classifier.
//!
//! Maps an arbitrary, adversarial free-form model identifier — produced by
//! Ollama, LM Studio, raw GGUF paths, whatever a provider happens to report —
//! to a normalized capability record. Pure, total, never panics. No other
//! component reinterprets model names; everything downstream (dispatcher,
//! `/v1/models`, tokenomics) goes through here.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Capability tier. The sole axis tokenomics prices against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
    Xl,
}

impl Tier {
    /// Parse a bare tier selector, case-insensitively. `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            "xl" => Some(Self::Xl),
            _ => None,
        }
    }

    /// Default context window for this tier (§4.1).
    pub fn default_context(self) -> u32 {
        match self {
            Self::Small => 4096,
            Self::Medium => 8192,
            Self::Large => 32768,
            Self::Xl => 32768,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Xl => "xl",
        })
    }
}

/// What kind of work a model performs. Derivation rules beyond the default
/// are not specified, so `classify` always reports `Llm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Image,
    Whisper,
    Multimodal,
}

/// Derived, cacheable capability record for a model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub tier: Tier,
    pub context: u32,
    #[serde(rename = "type")]
    pub model_type: ModelType,
}

impl ModelCapability {
    fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            context: tier.default_context(),
            model_type: ModelType::Llm,
        }
    }
}

/// The parsed shape of a requested model identifier. Shared between the
/// classifier (for capability lookup) and the dispatcher (for provider
/// compatibility matching, §4.5.1) so the grammar is defined exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Bare tier name: `"small"`, `"medium"`, `"large"`, `"xl"`.
    Tier(Tier),
    /// `<tier>|<substring>` — tier plus a lower-cased name hint.
    Combined(Tier, String),
    /// `<model>@<provider-handle>` — a specific model pinned to one provider.
    Addressed(String, String),
    /// Anything else — matched against advertised models by exact normalized name.
    Exact(String),
}

/// Parse the selector grammar. Returns `None` only for a malformed combined
/// selector (a `|` present but the left-hand side isn't a valid tier name) —
/// the one case in which the identifier space has no sensible interpretation.
pub fn parse_selector(identifier: &str) -> Option<Selector> {
    let trimmed = identifier.trim();

    if let Some(tier) = Tier::parse(trimmed) {
        return Some(Selector::Tier(tier));
    }

    if let Some((tier_str, sub)) = trimmed.split_once('|') {
        return Tier::parse(tier_str).map(|t| Selector::Combined(t, sub.trim().to_lowercase()));
    }

    if let Some((model, handle)) = trimmed.split_once('@') {
        return Some(Selector::Addressed(
            model.trim().to_string(),
            handle.trim().to_string(),
        ));
    }

    Some(Selector::Exact(trimmed.to_string()))
}

/// Classify a model identifier. `None` only for a malformed combined selector
/// (the caller maps this to `INVALID_MODEL`); otherwise always `Some`.
pub fn classify(identifier: &str) -> Option<ModelCapability> {
    match parse_selector(identifier)? {
        Selector::Tier(tier) => Some(ModelCapability::for_tier(tier)),
        Selector::Combined(tier, _) => Some(ModelCapability::for_tier(tier)),
        Selector::Addressed(model, _handle) => Some(classify_core(&model)),
        Selector::Exact(model) => Some(classify_core(&model)),
    }
}

/// Normalize a model identifier for exact-match comparison: strip a trailing
/// `:tag`, strip any `/`-delimited path/namespace prefix, lowercase.
pub fn normalize(identifier: &str) -> String {
    let lower = identifier.to_lowercase();
    let basename = lower.rsplit('/').next().unwrap_or(&lower);
    basename.split(':').next().unwrap_or(basename).to_string()
}

/// Resolution order for a plain identifier with no tier/combined/addressed
/// wrapping — rules 4 through 7 of §4.1. Always succeeds.
fn classify_core(identifier: &str) -> ModelCapability {
    let lower = identifier.to_lowercase();

    if lower.contains("mini") || lower.contains("tiny") || lower.contains("small") {
        return ModelCapability::for_tier(Tier::Small);
    }

    let basename = lower.rsplit('/').next().unwrap_or(&lower);
    let leading = basename
        .split(|c| c == '-' || c == ':' || c == '/')
        .next()
        .unwrap_or(basename);

    if let Some(rule) = family_table().iter().find(|(name, _)| *name == leading) {
        match rule.1 {
            FamilyRule::Fixed(tier) => return ModelCapability::for_tier(tier),
            FamilyRule::PhiVersion => return ModelCapability::for_tier(phi_version_tier(basename)),
            FamilyRule::SizeDependent => {
                if let Some(tier) = size_pattern_tier(&lower) {
                    return ModelCapability::for_tier(tier);
                }
                // Falls through to the default below — family matched but
                // no size suffix was present to disambiguate.
            }
        }
    }

    if let Some(tier) = size_pattern_tier(&lower) {
        return ModelCapability::for_tier(tier);
    }

    ModelCapability::for_tier(Tier::Medium)
}

#[derive(Debug, Clone, Copy)]
enum FamilyRule {
    Fixed(Tier),
    /// `phi` — capability depends on the version number (Phi-3 vs Phi-4).
    PhiVersion,
    /// `llama2` — capability depends on the parameter-count suffix (7b/13b/70b).
    SizeDependent,
}

/// Leading-token family table (§4.1 rule 5). Entries not covering every
/// family a provider might report — unmatched identifiers fall through to
/// the size-pattern table and then the medium default.
fn family_table() -> &'static [(&'static str, FamilyRule)] {
    &[
        ("mistral", FamilyRule::Fixed(Tier::Medium)),
        ("mixtral", FamilyRule::Fixed(Tier::Large)),
        ("qwen", FamilyRule::Fixed(Tier::Medium)),
        ("qwen2", FamilyRule::Fixed(Tier::Medium)),
        ("gemma", FamilyRule::Fixed(Tier::Medium)),
        ("gemma2", FamilyRule::Fixed(Tier::Medium)),
        ("phi", FamilyRule::PhiVersion),
        ("llama2", FamilyRule::SizeDependent),
    ]
}

/// Phi is versioned rather than sized: Phi-4 and later are `large`, earlier
/// releases default to `medium` (smaller variants are already caught by the
/// "mini" substring rule before this runs).
fn phi_version_tier(basename: &str) -> Tier {
    let version: Option<u32> = basename
        .trim_start_matches("phi")
        .trim_start_matches(['-', ':'])
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok();

    match version {
        Some(v) if v >= 4 => Tier::Large,
        _ => Tier::Medium,
    }
}

/// Size-pattern regex table (§4.1 rule 6), compiled once.
fn size_patterns() -> &'static [(Regex, Tier)] {
    static PATTERNS: OnceLock<Vec<(Regex, Tier)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (Regex::new(r"\b(6[5-9]|70)b\b").unwrap(), Tier::Xl),
            (Regex::new(r"mixtral|\b14b\b|\b20b\b").unwrap(), Tier::Large),
            (Regex::new(r"\b7b\b|mistral").unwrap(), Tier::Medium),
            (Regex::new(r"\b[1-3]\.?\d?b\b").unwrap(), Tier::Small),
        ]
    })
}

fn size_pattern_tier(lower_identifier: &str) -> Option<Tier> {
    // Largest-first so e.g. "70b" isn't also caught by a looser pattern.
    size_patterns()
        .iter()
        .find(|(re, _)| re.is_match(lower_identifier))
        .map(|(_, tier)| *tier)
}
