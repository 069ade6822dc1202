use std::{collections::BTreeSet, env, fs, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    models::{Tool, ToolCategory},
    progress::ProgressSettings,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub nmap_path: String,
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    pub scans_per_minute: usize,
    pub progress_throttle_secs: u64,
    pub quick_tool_threshold_secs: u64,
    pub quick_wait_timeout_ms: u64,
    pub quick_poll_interval_ms: u64,
    pub categories: Vec<ToolCategory>,
    pub tools: Vec<Tool>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("TOOLDOCK_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("TD_HOST") {
            self.host = v;
        }
        if let Some(v) = var("TD_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("TD_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("TD_NMAP_PATH") {
            self.nmap_path = v;
        }
        if let Some(v) = var("TD_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = v.parse().unwrap_or(self.max_concurrent_jobs);
        }
    }

    pub fn progress_settings(&self) -> ProgressSettings {
        ProgressSettings {
            throttle_interval: Duration::from_secs(self.progress_throttle_secs),
            quick_tool_threshold: Duration::from_secs(self.quick_tool_threshold_secs),
        }
    }

    pub fn quick_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.quick_wait_timeout_ms)
    }

    pub fn quick_poll_interval(&self) -> Duration {
        Duration::from_millis(self.quick_poll_interval_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://tooldock.db".to_string(),
            nmap_path: "nmap".to_string(),
            max_concurrent_jobs: 4,
            queue_capacity: 128,
            scans_per_minute: 30,
            progress_throttle_secs: 5,
            quick_tool_threshold_secs: 30,
            quick_wait_timeout_ms: 10_000,
            quick_poll_interval_ms: 500,
            categories: vec![ToolCategory {
                id: "network_scanning".to_string(),
                name: "Network Scanning".to_string(),
                description: "Discover hosts, open ports and running services".to_string(),
                icon: "network".to_string(),
            }],
            tools: vec![default_nmap_tool()],
        }
    }
}

fn default_nmap_tool() -> Tool {
    Tool {
        name: "nmap".to_string(),
        display_name: "Nmap Port Scanner".to_string(),
        category: "network_scanning".to_string(),
        description: "Network discovery and port scanning".to_string(),
        long_description: Some(
            "Scans a host or range for open ports, identifies service versions and \
             reports known CVEs from vulners script output."
                .to_string(),
        ),
        icon: "radar".to_string(),
        requires_consent: true,
        input_schema: json!({
            "type": "object",
            "properties": {
                "scan_type": {"type": "string", "enum": ["quick", "default"], "default": "default"},
                "ports": {"type": "string", "description": "nmap port list, e.g. 22,80,443 or 1-1024"}
            }
        }),
        supported_input_types: ["ip", "ip_range", "domain", "url"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>(),
        estimated_duration: 120,
        difficulty: "beginner".to_string(),
        runner: "nmap".to_string(),
    }
}
