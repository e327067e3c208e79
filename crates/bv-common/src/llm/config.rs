use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// Any `/v1/chat/completions` compatible endpoint.
    OpenAiCompatible,
    Anthropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRuntimeConfig {
    pub enabled: bool,
    pub provider_name: String,
    pub provider: LlmProvider,
    pub model: String,
    pub endpoint: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub max_input_chars: usize,
}

impl Default for LlmRuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider_name: "openai".into(),
            provider: LlmProvider::OpenAiCompatible,
            model: "gpt-4o-mini".into(),
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            api_key: String::new(),
            timeout_secs: 60,
            max_retries: 3,
            retry_backoff_secs: 5,
            max_input_chars: 120_000,
        }
    }
}

fn provider_defaults(provider: &str) -> (LlmProvider, &'static str, &'static str) {
    match provider.to_ascii_lowercase().as_str() {
        "anthropic" => (
            LlmProvider::Anthropic,
            "claude-3-5-sonnet-20240620",
            "https://api.anthropic.com/v1/messages",
        ),
        "mistral" => (
            LlmProvider::OpenAiCompatible,
            "mistral-large-latest",
            "https://api.mistral.ai/v1/chat/completions",
        ),
        "deepseek" => (
            LlmProvider::OpenAiCompatible,
            "deepseek-chat",
            "https://api.deepseek.com/v1/chat/completions",
        ),
        "local" => (
            LlmProvider::OpenAiCompatible,
            "local-model",
            "http://localhost:8000/v1/chat/completions",
        ),
        _ => (
            LlmProvider::OpenAiCompatible,
            "gpt-4o-mini",
            "https://api.openai.com/v1/chat/completions",
        ),
    }
}

fn provider_api_key(provider: &str) -> Option<String> {
    match provider.to_ascii_lowercase().as_str() {
        "openai" => std::env::var("OPENAI_API_KEY").ok(),
        "anthropic" => std::env::var("ANTHROPIC_API_KEY").ok(),
        "mistral" => std::env::var("MISTRAL_API_KEY").ok(),
        "deepseek" => std::env::var("DEEPSEEK_API_KEY").ok(),
        _ => None,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl LlmRuntimeConfig {
    pub fn from_env() -> Self {
        let provider_name = std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".into());
        let (provider, default_model, default_endpoint) = provider_defaults(&provider_name);
        let api_key = std::env::var("LLM_API_KEY")
            .ok()
            .or_else(|| provider_api_key(&provider_name))
            .unwrap_or_default();

        Self {
            enabled: parse_bool("LLM_ENABLED", true),
            provider_name: provider_name.to_ascii_lowercase(),
            provider,
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| default_model.into()),
            endpoint: std::env::var("LLM_ENDPOINT").unwrap_or_else(|_| default_endpoint.into()),
            api_key,
            timeout_secs: parse_num("LLM_TIMEOUT_SECONDS", 60),
            max_retries: parse_num("LLM_MAX_RETRIES", 3),
            retry_backoff_secs: parse_num("LLM_RETRY_BACKOFF_SECONDS", 5),
            max_input_chars: parse_num("LLM_MAX_INPUT_CHARS", 120_000),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "LLM_PROVIDER",
        "LLM_MODEL",
        "LLM_ENDPOINT",
        "LLM_API_KEY",
        "ANTHROPIC_API_KEY",
        "LLM_MAX_RETRIES",
        "LLM_RETRY_BACKOFF_SECONDS",
        "LLM_ENABLED",
    ];

    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        for key in KEYS {
            unsafe { std::env::remove_var(key) };
        }
        for (key, value) in vars {
            unsafe { std::env::set_var(key, value) };
        }
        f();
        for key in KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn anthropic_provider_picks_its_defaults_and_key() {
        with_env(
            &[("LLM_PROVIDER", "Anthropic"), ("ANTHROPIC_API_KEY", "sk-ant")],
            || {
                let config = LlmRuntimeConfig::from_env();
                assert_eq!(config.provider, LlmProvider::Anthropic);
                assert_eq!(config.provider_name, "anthropic");
                assert_eq!(config.endpoint, "https://api.anthropic.com/v1/messages");
                assert_eq!(config.api_key, "sk-ant");
            },
        );
    }

    #[test]
    fn explicit_overrides_win_and_garbage_falls_back() {
        with_env(
            &[
                ("LLM_PROVIDER", "local"),
                ("LLM_MODEL", "bid-extractor"),
                ("LLM_API_KEY", "k"),
                ("LLM_MAX_RETRIES", "many"),
                ("LLM_RETRY_BACKOFF_SECONDS", "2"),
                ("LLM_ENABLED", "off"),
            ],
            || {
                let config = LlmRuntimeConfig::from_env();
                assert!(!config.enabled);
                assert_eq!(config.model, "bid-extractor");
                assert_eq!(config.endpoint, "http://localhost:8000/v1/chat/completions");
                assert_eq!(config.max_retries, 3);
                assert_eq!(config.retry_policy().backoff, Duration::from_secs(2));
            },
        );
    }
}
