// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Server configuration: defaults, TOML file, environment overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "AGENT_RELAY";

/// One named logical agent exposed by this server. Immutable at
/// runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt_suffix: Option<String>,
    #[serde(default)]
    pub settings_file: Option<PathBuf>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Per-invocation cost cap passed through to the worker.
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Scopes a token must carry to address this agent; empty means
    /// any authenticated caller.
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub worker_binary: PathBuf,
    pub master_key: Option<String>,
    pub jwt_secret: Option<String>,
    /// Include verify-failure detail in 401 bodies.
    pub token_debug: bool,
    pub jwt_algorithm: String,
    pub access_token_ttl_secs: u64,
    pub refresh_enabled: bool,
    pub refresh_token_ttl_secs: u64,
    pub default_rpm: u32,
    pub burst: u32,
    pub global_daily_limit_usd: f64,
    pub default_client_daily_limit_usd: f64,
    pub max_concurrent_sessions: usize,
    pub max_sessions_per_client: usize,
    pub session_max_idle: Duration,
    pub session_max_lifetime: Duration,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
    pub max_buffer_bytes: usize,
    pub kill_grace: Duration,
    pub shutdown_deadline: Duration,
    pub enable_cors: bool,
    pub agents: Vec<AgentDefinition>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8314".parse().expect("static addr"),
            data_dir: PathBuf::from("./data"),
            worker_binary: PathBuf::from("claude"),
            master_key: None,
            jwt_secret: None,
            token_debug: false,
            jwt_algorithm: "HS256".to_string(),
            access_token_ttl_secs: 3600,
            refresh_enabled: false,
            refresh_token_ttl_secs: 30 * 24 * 3600,
            default_rpm: 60,
            burst: 10,
            global_daily_limit_usd: 100.0,
            default_client_daily_limit_usd: 10.0,
            max_concurrent_sessions: 10,
            max_sessions_per_client: 5,
            session_max_idle: Duration::from_secs(3600),
            session_max_lifetime: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(300),
            max_buffer_bytes: 10 * 1024 * 1024,
            kill_grace: Duration::from_secs(5),
            shutdown_deadline: Duration::from_secs(10),
            enable_cors: false,
            agents: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Whether any authentication is configured at all.
    pub fn requires_auth(&self) -> bool {
        self.master_key.is_some() || self.jwt_secret.is_some()
    }

    /// Hard invariant: without authentication the server refuses to
    /// bind anything but loopback.
    pub fn ensure_bind_safe(&self) -> Result<(), String> {
        if !self.requires_auth() && !self.bind_addr.ip().is_loopback() {
            return Err(format!(
                "refusing to bind {} without authentication configured; \
                 set {ENV_PREFIX}_MASTER_KEY or {ENV_PREFIX}_JWT_SECRET, \
                 or bind a loopback address",
                self.bind_addr
            ));
        }
        Ok(())
    }

    /// Database file inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("agent-relay.db")
    }

    /// Default worker working directory.
    pub fn workdir(&self) -> PathBuf {
        self.data_dir.join("workdir")
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Deterministic default agent: the first enabled one.
    pub fn default_agent(&self) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.enabled)
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter().filter(|a| a.enabled)
    }

    /// Load a config file (if given), then apply environment
    /// overrides.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(path) = file {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
            let file: FileConfig = toml::from_str(&raw)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
            file.apply(&mut config)?;
        }
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(key) = std::env::var(format!("{ENV_PREFIX}_MASTER_KEY")) {
            if !key.is_empty() {
                self.master_key = Some(key);
            }
        }
        if let Ok(secret) = std::env::var(format!("{ENV_PREFIX}_JWT_SECRET")) {
            if !secret.is_empty() {
                self.jwt_secret = Some(secret);
            }
        }
        if let Ok(port) = std::env::var(format!("{ENV_PREFIX}_PORT")) {
            let port: u16 = port.parse().map_err(|_| anyhow::anyhow!("invalid port: {port}"))?;
            self.bind_addr.set_port(port);
        }
        if let Ok(dir) = std::env::var(format!("{ENV_PREFIX}_DATA_DIR")) {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }
}

/// On-disk TOML shape; every field optional so partial files work.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_addr: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
    worker_binary: Option<PathBuf>,
    master_key: Option<String>,
    jwt_secret: Option<String>,
    token_debug: Option<bool>,
    jwt_algorithm: Option<String>,
    access_token_ttl_secs: Option<u64>,
    refresh_enabled: Option<bool>,
    refresh_token_ttl_secs: Option<u64>,
    default_rpm: Option<u32>,
    burst: Option<u32>,
    global_daily_limit_usd: Option<f64>,
    default_client_daily_limit_usd: Option<f64>,
    max_concurrent_sessions: Option<usize>,
    max_sessions_per_client: Option<usize>,
    session_max_idle_secs: Option<u64>,
    session_max_lifetime_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    max_buffer_bytes: Option<usize>,
    kill_grace_secs: Option<u64>,
    shutdown_deadline_secs: Option<u64>,
    enable_cors: Option<bool>,
    #[serde(default)]
    agents: Vec<AgentDefinition>,
}

impl FileConfig {
    fn apply(self, config: &mut ServerConfig) -> anyhow::Result<()> {
        macro_rules! set {
            ($field:ident) => {
                if let Some(value) = self.$field {
                    config.$field = value;
                }
            };
        }
        set!(bind_addr);
        set!(data_dir);
        set!(worker_binary);
        set!(token_debug);
        set!(jwt_algorithm);
        set!(access_token_ttl_secs);
        set!(refresh_enabled);
        set!(refresh_token_ttl_secs);
        set!(default_rpm);
        set!(burst);
        set!(global_daily_limit_usd);
        set!(default_client_daily_limit_usd);
        set!(max_concurrent_sessions);
        set!(max_sessions_per_client);
        set!(max_buffer_bytes);
        set!(enable_cors);
        if let Some(key) = self.master_key {
            config.master_key = Some(key);
        }
        if let Some(secret) = self.jwt_secret {
            config.jwt_secret = Some(secret);
        }
        if let Some(secs) = self.session_max_idle_secs {
            config.session_max_idle = Duration::from_secs(secs);
        }
        if let Some(secs) = self.session_max_lifetime_secs {
            config.session_max_lifetime = Duration::from_secs(secs);
        }
        if let Some(secs) = self.sweep_interval_secs {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.kill_grace_secs {
            config.kill_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.shutdown_deadline_secs {
            config.shutdown_deadline = Duration::from_secs(secs);
        }
        if !self.agents.is_empty() {
            config.agents = self.agents;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_loopback_bind_without_auth_is_refused() {
        let mut config = ServerConfig::default();
        config.bind_addr = "0.0.0.0:8314".parse().unwrap();
        assert!(config.ensure_bind_safe().is_err());

        config.master_key = Some("secret".into());
        assert!(config.ensure_bind_safe().is_ok());
    }

    #[test]
    fn loopback_bind_without_auth_is_allowed() {
        let config = ServerConfig::default();
        assert!(config.ensure_bind_safe().is_ok());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
bind_addr = "127.0.0.1:9999"
default_rpm = 120
request_timeout_secs = 30

[[agents]]
name = "general"
description = "General assistant"

[[agents]]
name = "code"
enabled = false
required_scopes = ["code"]
"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_addr.port(), 9999);
        assert_eq!(config.default_rpm, 120);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.agents.len(), 2);
        assert!(config.agents[0].enabled);
        assert!(!config.agents[1].enabled);
        assert_eq!(config.default_agent().unwrap().name, "general");
        assert_eq!(config.agent("code").unwrap().required_scopes, vec!["code"]);
    }

    #[test]
    fn default_agent_skips_disabled() {
        let mut config = ServerConfig::default();
        config.agents = vec![
            AgentDefinition {
                name: "off".into(),
                description: String::new(),
                enabled: false,
                model: None,
                system_prompt_suffix: None,
                settings_file: None,
                permission_mode: None,
                allowed_tools: vec![],
                max_cost_usd: None,
                required_scopes: vec![],
                working_dir: None,
            },
            AgentDefinition {
                name: "on".into(),
                description: String::new(),
                enabled: true,
                model: None,
                system_prompt_suffix: None,
                settings_file: None,
                permission_mode: None,
                allowed_tools: vec![],
                max_cost_usd: None,
                required_scopes: vec![],
                working_dir: None,
            },
        ];
        assert_eq!(config.default_agent().unwrap().name, "on");
    }
}
