//! Static seed configuration for providers, profiles and tunables.
//!
//! Upserted into SQLite at boot by `registry::seed_defaults`, so the rows
//! are immutable in practice: every start re-asserts this table.

pub struct ProviderSeed {
    pub id: &'static str,
    pub kind: &'static str,
    pub display: &'static str,
    pub base_url: Option<&'static str>,
    /// Official key-acquisition location, surfaced as the setup hint when a
    /// credential is missing.
    pub setup_url: &'static str,
    /// Model-name prefixes that resolve to this provider.
    pub prefixes: &'static [&'static str],
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub requires_api_key: bool,
}

pub const PROVIDER_SEEDS: &[ProviderSeed] = &[
    ProviderSeed {
        id: "gemini",
        kind: "cloud",
        display: "Google Gemini",
        base_url: Some("https://generativelanguage.googleapis.com/v1beta"),
        setup_url: "https://ai.google.dev/",
        prefixes: &["gemini"],
        default_temperature: 0.7,
        default_max_tokens: 4096,
        requires_api_key: true,
    },
    ProviderSeed {
        id: "openai",
        kind: "cloud",
        display: "OpenAI GPT",
        base_url: Some("https://api.openai.com"),
        setup_url: "https://platform.openai.com/",
        prefixes: &["gpt", "o1"],
        default_temperature: 0.7,
        default_max_tokens: 4096,
        requires_api_key: true,
    },
    ProviderSeed {
        id: "anthropic",
        kind: "cloud",
        display: "Anthropic Claude",
        base_url: Some("https://api.anthropic.com"),
        setup_url: "https://console.anthropic.com/",
        prefixes: &["claude"],
        default_temperature: 0.7,
        default_max_tokens: 4096,
        requires_api_key: true,
    },
    ProviderSeed {
        id: "deepseek",
        kind: "cloud",
        display: "DeepSeek",
        base_url: Some("https://api.deepseek.com"),
        setup_url: "https://platform.deepseek.com/",
        prefixes: &["deepseek"],
        default_temperature: 0.7,
        default_max_tokens: 2000,
        requires_api_key: true,
    },
    ProviderSeed {
        id: "ollama",
        kind: "local",
        display: "Ollama (local)",
        base_url: Some("http://127.0.0.1:11434"),
        setup_url: "https://ollama.ai/",
        prefixes: &["ollama"],
        default_temperature: 0.6,
        default_max_tokens: 8192,
        requires_api_key: false,
    },
];

pub struct ProfileSeed {
    pub key: &'static str,
    pub provider: &'static str,
    pub model: &'static str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub description: &'static str,
}

pub const PROFILE_SEEDS: &[ProfileSeed] = &[
    ProfileSeed {
        key: "fast",
        provider: "ollama",
        model: "gemma:2b",
        temperature: 0.3,
        max_tokens: 4096,
        description: "Scout. Quick answers, low resource use.",
    },
    ProfileSeed {
        key: "balanced",
        provider: "ollama",
        model: "deepseek-r1:7b",
        temperature: 0.6,
        max_tokens: 8192,
        description: "Main operator. Balance between logic and creativity.",
    },
    ProfileSeed {
        key: "creative",
        provider: "ollama",
        model: "mistral",
        temperature: 0.9,
        max_tokens: 12000,
        description: "Creative analyst. Brainstorming and lateral answers.",
    },
    ProfileSeed {
        key: "security",
        provider: "ollama",
        model: "llama3",
        temperature: 0.1,
        max_tokens: 4096,
        description: "Watchdog. Dry logic, zero drama.",
    },
    ProfileSeed {
        key: "deepseek",
        provider: "deepseek",
        model: "deepseek-chat",
        temperature: 0.7,
        max_tokens: 16000,
        description: "External analyst. Full DeepSeek API.",
    },
];

pub const DEFAULT_PROFILE: &str = "balanced";
pub const DEFAULT_FAILOVER_CHAIN: &[&str] = &["balanced", "fast", "security"];

/// Model generation latency is highly variable; the per-call deadline is
/// deliberately long.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
