//! `agentfarm.toml` loading.
//!
//! ```toml
//! [orchestrator]
//! strategy = "least-busy"
//! max_concurrent_tasks = 10
//!
//! [orchestrator.retry]
//! max_attempts = 3
//! base_delay_ms = 5000
//!
//! [[agents]]
//! id = "claude"
//! name = "Claude"
//! capabilities = ["chat", "code"]
//! endpoint = "https://automation.example.com/webhook/claude"
//! auth_token_env = "CLAUDE_WEBHOOK_TOKEN"
//! ```

use agentfarm_orchestrator::{AgentConfig, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One `[[agents]]` entry: the registry config plus how to reach the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(flatten)]
    pub agent: AgentConfig,
    /// Webhook URL. Agents without one get an in-process echo backend.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding a bearer token.
    #[serde(default)]
    pub auth_token_env: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

impl FarmConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: FarmConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&text)
    }

    /// Replace concurrency and timeout with a named preset.
    pub fn apply_preset(&mut self, name: &str) -> anyhow::Result<()> {
        let preset = OrchestratorConfig::preset(name)?;
        self.orchestrator.max_concurrent_tasks = preset.max_concurrent_tasks;
        self.orchestrator.default_timeout_ms = preset.default_timeout_ms;
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator.validate()?;
        let mut seen = HashSet::new();
        for entry in &self.agents {
            entry.agent.validate()?;
            if !seen.insert(entry.agent.id.as_str()) {
                anyhow::bail!("agent id '{}' is configured twice", entry.agent.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentfarm_orchestrator::Strategy;
    use std::io::Write;

    const SAMPLE: &str = r#"
[orchestrator]
strategy = "priority"
max_concurrent_tasks = 4

[orchestrator.retry]
max_attempts = 2

[[agents]]
id = "claude"
name = "Claude"
provider = "anthropic"
capabilities = ["chat", "code"]
priority = 1
endpoint = "http://localhost:5678/webhook/claude"
auth_token_env = "CLAUDE_TOKEN"

[[agents]]
id = "local"
name = "Local echo"
"#;

    #[test]
    fn test_parse_sample() {
        let config = FarmConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.orchestrator.strategy, Strategy::Priority);
        assert_eq!(config.orchestrator.max_concurrent_tasks, 4);
        assert_eq!(config.orchestrator.retry.max_attempts, 2);
        assert_eq!(config.orchestrator.retry.base_delay_ms, 5_000);

        assert_eq!(config.agents.len(), 2);
        let claude = &config.agents[0];
        assert!(claude.agent.capabilities.contains("code"));
        assert_eq!(claude.agent.priority, 1);
        assert_eq!(claude.auth_token_env.as_deref(), Some("CLAUDE_TOKEN"));

        let local = &config.agents[1];
        assert!(local.endpoint.is_none());
        assert_eq!(local.agent.concurrency_limit, 5);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FarmConfig::parse("").unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.orchestrator.max_concurrent_tasks, 10);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let err = FarmConfig::parse("[orchestrator]\nstrategy = \"fastest\"\n").unwrap_err();
        assert!(err.to_string().contains("fastest"));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let text = "[[agents]]\nid = \"a\"\nname = \"A\"\n\n[[agents]]\nid = \"a\"\nname = \"B\"\n";
        let err = FarmConfig::parse(text).unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_zero_concurrency_agent_rejected() {
        let text = "[[agents]]\nid = \"a\"\nname = \"A\"\nconcurrency_limit = 0\n";
        assert!(FarmConfig::parse(text).is_err());
    }

    #[test]
    fn test_apply_preset() {
        let mut config = FarmConfig::parse(SAMPLE).unwrap();
        config.apply_preset("conservative").unwrap();
        assert_eq!(config.orchestrator.max_concurrent_tasks, 2);
        assert_eq!(config.orchestrator.default_timeout_ms, 600_000);
        // strategy and retry survive
        assert_eq!(config.orchestrator.strategy, Strategy::Priority);
        assert!(config.apply_preset("warp").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentfarm.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = FarmConfig::load(&path).await.unwrap();
        assert_eq!(config.agents[0].agent.id, "claude");

        let missing = FarmConfig::load(&dir.path().join("nope.toml")).await;
        assert!(missing.unwrap_err().to_string().contains("Failed to read"));
    }
}
