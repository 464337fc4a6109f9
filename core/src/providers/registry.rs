//! Provider registry: profile lookup and model-name resolution.
//!
//! Resolution consults an explicit rule table rather than ad hoc substring
//! containment: an exact profile-key match wins, otherwise the longest
//! registered name prefix decides, otherwise the local no-credential
//! provider takes the call.

use std::time::Duration;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::seeds::{
    PROFILE_SEEDS, PROVIDER_SEEDS, DEFAULT_FAILOVER_CHAIN, DEFAULT_HISTORY_LIMIT,
    DEFAULT_PROFILE, DEFAULT_TIMEOUT_SECS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub kind: String,
    pub display_name: String,
    pub base_url: Option<String>,
    pub setup_url: String,
    pub prefixes: Vec<String>,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub requires_api_key: bool,
}

/// Everything the dispatcher needs to drive one backend call.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderProfile {
    /// Set when the profile came from the configured profile table rather
    /// than prefix resolution.
    pub key: Option<String>,
    pub provider: ProviderInfo,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ProviderProfile {
    pub fn requires_credential(&self) -> bool {
        self.provider.requires_api_key
    }
}

/// Upsert the provider/profile seed tables and assert settings defaults.
/// Idempotent; runs at every boot.
pub fn seed_defaults(conn: &Connection) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for seed in PROVIDER_SEEDS {
        let prefixes_json = serde_json::to_string(seed.prefixes)?;
        conn.execute(
            "INSERT INTO ai_providers (id, kind, display_name, base_url, setup_url, prefixes_json, default_temperature, default_max_tokens, requires_api_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind,
                 display_name = excluded.display_name,
                 base_url = excluded.base_url,
                 setup_url = excluded.setup_url,
                 prefixes_json = excluded.prefixes_json,
                 default_temperature = excluded.default_temperature,
                 default_max_tokens = excluded.default_max_tokens,
                 requires_api_key = excluded.requires_api_key,
                 updated_at = excluded.updated_at",
            params![
                seed.id,
                seed.kind,
                seed.display,
                seed.base_url,
                seed.setup_url,
                prefixes_json,
                seed.default_temperature as f64,
                seed.default_max_tokens,
                seed.requires_api_key as i32,
                now,
            ],
        )?;
    }

    for seed in PROFILE_SEEDS {
        conn.execute(
            "INSERT INTO ai_profiles (key, provider_id, model, temperature, max_tokens, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(key) DO UPDATE SET
                 provider_id = excluded.provider_id,
                 model = excluded.model,
                 temperature = excluded.temperature,
                 max_tokens = excluded.max_tokens,
                 description = excluded.description,
                 updated_at = excluded.updated_at",
            params![
                seed.key,
                seed.provider,
                seed.model,
                seed.temperature as f64,
                seed.max_tokens,
                seed.description,
                now,
            ],
        )?;
    }

    let chain_json = serde_json::to_string(DEFAULT_FAILOVER_CHAIN)?;
    let defaults: &[(&str, String)] = &[
        ("dispatch.default_profile", DEFAULT_PROFILE.to_string()),
        ("dispatch.failover_chain", chain_json),
        ("dispatch.timeout_secs", DEFAULT_TIMEOUT_SECS.to_string()),
        ("memory.max_turns", DEFAULT_HISTORY_LIMIT.to_string()),
    ];
    for (key, value) in defaults {
        conn.execute(
            "INSERT OR IGNORE INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;
    }

    Ok(())
}

pub fn list_providers(conn: &Connection) -> Result<Vec<ProviderInfo>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, display_name, base_url, setup_url, prefixes_json, default_temperature, default_max_tokens, requires_api_key
         FROM ai_providers ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], row_to_provider)?;
    let mut providers = Vec::new();
    for row in rows {
        providers.push(row?);
    }
    Ok(providers)
}

pub fn get_provider(conn: &Connection, provider_id: &str) -> Result<ProviderInfo> {
    conn.query_row(
        "SELECT id, kind, display_name, base_url, setup_url, prefixes_json, default_temperature, default_max_tokens, requires_api_key
         FROM ai_providers WHERE id = ?1",
        params![provider_id],
        row_to_provider,
    )
    .map_err(|_| anyhow!("Unknown AI provider: {provider_id}"))
}

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderInfo> {
    let prefixes_json: String = row.get(5)?;
    let prefixes: Vec<String> = serde_json::from_str(&prefixes_json).unwrap_or_default();
    Ok(ProviderInfo {
        id: row.get(0)?,
        kind: row.get(1)?,
        display_name: row.get(2)?,
        base_url: row.get(3)?,
        setup_url: row.get(4)?,
        prefixes,
        default_temperature: row.get::<_, f64>(6)? as f32,
        default_max_tokens: row.get::<_, i64>(7)? as u32,
        requires_api_key: row.get::<_, i64>(8)? != 0,
    })
}

/// Resolve a requested model (or profile key) to a runnable profile.
pub fn resolve(conn: &Connection, requested: &str) -> Result<ProviderProfile> {
    let normalized = requested.trim().to_lowercase();
    let lookup = if normalized.is_empty() {
        read_setting(conn, "dispatch.default_profile")?.unwrap_or_else(|| DEFAULT_PROFILE.to_string())
    } else {
        normalized.clone()
    };

    if let Some(profile) = profile_by_key(conn, &lookup)? {
        return Ok(profile);
    }

    let providers = list_providers(conn)?;
    let mut best: Option<(&ProviderInfo, usize)> = None;
    for provider in &providers {
        for prefix in &provider.prefixes {
            if normalized.starts_with(prefix.as_str())
                && best.map_or(true, |(_, len)| prefix.len() > len)
            {
                best = Some((provider, prefix.len()));
            }
        }
    }

    let provider = match best {
        Some((provider, _)) => provider.clone(),
        None => providers
            .iter()
            .find(|p| p.kind == "local")
            .cloned()
            .ok_or_else(|| anyhow!("no local provider seeded"))?,
    };

    Ok(ProviderProfile {
        key: None,
        model: requested.trim().to_string(),
        temperature: provider.default_temperature,
        max_tokens: provider.default_max_tokens,
        provider,
    })
}

fn profile_by_key(conn: &Connection, key: &str) -> Result<Option<ProviderProfile>> {
    let row = conn
        .query_row(
            "SELECT key, provider_id, model, temperature, max_tokens FROM ai_profiles WHERE key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((key, provider_id, model, temperature, max_tokens)) = row else {
        return Ok(None);
    };
    let provider = get_provider(conn, &provider_id)?;
    Ok(Some(ProviderProfile {
        key: Some(key),
        provider,
        model,
        temperature: temperature as f32,
        max_tokens: max_tokens as u32,
    }))
}

/// Ordered profile keys tried in sequence after the requested profile fails.
pub fn failover_chain(conn: &Connection) -> Result<Vec<String>> {
    match read_setting(conn, "dispatch.failover_chain")? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(DEFAULT_FAILOVER_CHAIN.iter().map(|s| s.to_string()).collect()),
    }
}

pub fn backend_timeout(conn: &Connection) -> Result<Duration> {
    let secs = read_setting(conn, "dispatch.timeout_secs")?
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Ok(Duration::from_secs(secs))
}

pub fn history_limit(conn: &Connection) -> Result<usize> {
    Ok(read_setting(conn, "memory.max_turns")?
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_HISTORY_LIMIT))
}

pub fn put_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    Ok(())
}

fn read_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_pool;

    #[test]
    fn gpt_models_resolve_to_openai() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let profile = resolve(&conn, "gpt-4o").unwrap();
        assert_eq!(profile.provider.id, "openai");
        assert_eq!(profile.model, "gpt-4o");
        assert!(profile.requires_credential());
    }

    #[test]
    fn unknown_models_fall_back_to_the_local_provider() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let profile = resolve(&conn, "unknown-model-xyz").unwrap();
        assert_eq!(profile.provider.id, "ollama");
        assert!(!profile.requires_credential());
    }

    #[test]
    fn prefixed_local_models_stay_local() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let profile = resolve(&conn, "ollama-llama3").unwrap();
        assert_eq!(profile.provider.id, "ollama");
        assert_eq!(profile.model, "ollama-llama3");
    }

    #[test]
    fn profile_keys_win_over_prefix_rules() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        // "deepseek" is both a profile key and a provider prefix; the
        // profile row decides
        let profile = resolve(&conn, "deepseek").unwrap();
        assert_eq!(profile.key.as_deref(), Some("deepseek"));
        assert_eq!(profile.model, "deepseek-chat");
        assert_eq!(profile.max_tokens, 16000);
    }

    #[test]
    fn configured_profiles_carry_their_sampling_parameters() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let profile = resolve(&conn, "balanced").unwrap();
        assert_eq!(profile.provider.id, "ollama");
        assert_eq!(profile.model, "deepseek-r1:7b");
        assert!((profile.temperature - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn empty_request_uses_the_default_profile() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        let profile = resolve(&conn, "  ").unwrap();
        assert_eq!(profile.key.as_deref(), Some("balanced"));
    }

    #[test]
    fn resolution_is_case_insensitive_and_idempotent() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        for _ in 0..3 {
            assert_eq!(resolve(&conn, "GPT-4O").unwrap().provider.id, "openai");
            assert_eq!(resolve(&conn, "Claude-3-Opus").unwrap().provider.id, "anthropic");
            assert_eq!(resolve(&conn, "gemini-1.5-pro").unwrap().provider.id, "gemini");
        }
    }

    #[test]
    fn seeding_twice_keeps_one_row_per_provider() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        seed_defaults(&conn).unwrap();
        let providers = list_providers(&conn).unwrap();
        assert_eq!(providers.len(), PROVIDER_SEEDS.len());
    }

    #[test]
    fn failover_chain_defaults_and_overrides() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        assert_eq!(failover_chain(&conn).unwrap(), vec!["balanced", "fast", "security"]);

        put_setting(&conn, "dispatch.failover_chain", r#"["fast"]"#).unwrap();
        assert_eq!(failover_chain(&conn).unwrap(), vec!["fast"]);
    }

    #[test]
    fn timeout_and_history_settings_have_defaults() {
        let pool = test_pool();
        let conn = pool.get().unwrap();
        assert_eq!(backend_timeout(&conn).unwrap(), Duration::from_secs(600));
        assert_eq!(history_limit(&conn).unwrap(), 20);
    }
}
