//! Runtime configuration
//!
//! Every section has a sensible `Default`; `OrchestratorConfig::from_env`
//! overlays environment variables (load `.env` first in binaries).

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for history compaction
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Compact when last run's peak prompt tokens reach this value
    pub trigger_tokens: u64,
    /// Compact when this many user messages accumulated since last compaction
    pub fallback_user_count: usize,
    /// Token allowance for verbatim recent turns
    pub tail_token_budget: usize,
    /// Upper bound on synopsis length
    pub max_summary_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            trigger_tokens: 25_000,
            fallback_user_count: 20,
            tail_token_budget: 4_000,
            max_summary_tokens: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolLoopConfig {
    /// Tool invocations allowed per specialist invocation
    pub specialist_ceiling: u32,
    /// Tool invocations (handoffs included) allowed to the coordinator per turn
    pub supervisor_ceiling: u32,
    pub max_handoffs_per_turn: u32,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            specialist_ceiling: 5,
            supervisor_ceiling: 6,
            max_handoffs_per_turn: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub channel_capacity: usize,
    /// Consumer-side bounded wait; expiry means "no event yet"
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_024,
            idle_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub specialist_ttl: Duration,
    pub snapshot_ttl: Duration,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            specialist_ttl: Duration::from_secs(15 * 60),
            snapshot_ttl: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub tools_base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            gemini_model: "gemini-2.0-flash".to_string(),
            tools_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub compaction: CompactionConfig,
    pub tool_loop: ToolLoopConfig,
    pub stream: StreamConfig,
    pub cache: CacheConfig,
    pub model: ModelConfig,
    pub database_url: Option<String>,
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        let c = &mut config.compaction;
        c.trigger_tokens = env_or("COMPACTION_TRIGGER_TOKENS", c.trigger_tokens)?;
        c.fallback_user_count = env_or("COMPACTION_FALLBACK_USER_COUNT", c.fallback_user_count)?;
        c.tail_token_budget = env_or("COMPACTION_TAIL_TOKENS", c.tail_token_budget)?;
        c.max_summary_tokens = env_or("COMPACTION_MAX_SUMMARY_TOKENS", c.max_summary_tokens)?;

        let t = &mut config.tool_loop;
        t.specialist_ceiling = env_or("SPECIALIST_TOOL_CEILING", t.specialist_ceiling)?;
        t.supervisor_ceiling = env_or("SUPERVISOR_TOOL_CEILING", t.supervisor_ceiling)?;
        t.max_handoffs_per_turn = env_or("MAX_HANDOFFS_PER_TURN", t.max_handoffs_per_turn)?;

        let s = &mut config.stream;
        s.channel_capacity = env_or("STREAM_CHANNEL_CAPACITY", s.channel_capacity)?;
        s.idle_timeout = Duration::from_millis(env_or(
            "STREAM_IDLE_TIMEOUT_MS",
            s.idle_timeout.as_millis() as u64,
        )?);

        let k = &mut config.cache;
        k.specialist_ttl = secs_or("SPECIALIST_CACHE_TTL_SECS", k.specialist_ttl)?;
        k.snapshot_ttl = secs_or("SNAPSHOT_CACHE_TTL_SECS", k.snapshot_ttl)?;
        k.session_ttl = secs_or("SESSION_TTL_SECS", k.session_ttl)?;
        k.sweep_interval = secs_or("CACHE_SWEEP_INTERVAL_SECS", k.sweep_interval)?;

        config.model.gemini_api_key = env::var("GEMINI_API_KEY").unwrap_or_default();
        if let Ok(model) = env::var("GEMINI_MODEL") {
            config.model.gemini_model = model;
        }
        config.model.tools_base_url = env::var("FINANCIAL_API_BASE_URL")
            .or_else(|_| env::var("TOOLS_API_BASE_URL"))
            .ok();
        config.database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        if config.stream.channel_capacity == 0 {
            return Err(OrchestrationError::ConfigError(
                "STREAM_CHANNEL_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|_| {
            OrchestrationError::ConfigError(format!("{} has invalid value '{}'", key, raw))
        }),
        _ => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}
