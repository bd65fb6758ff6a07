use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ClientConfig {
    pub gateway: GatewayConfig,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    pub commands: CommandConfig,
    pub operator: OperatorConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket endpoint; `${site_id}` is replaced per site.
    pub ws_url: String,
    pub http_base_url: String,
    pub http_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:9003/ws/device${site_id}".to_string(),
            http_base_url: "http://localhost:9003/api".to_string(),
            http_timeout_secs: 10,
            connect_timeout_secs: 10,
        }
    }
}

impl GatewayConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_secs: u64,
    pub snapshot_delay_ms: u64,
    pub status_fallback_secs: u64,
    pub poll_secs: u64,
    /// Keep a site's session alive after its last screen detaches.
    pub keep_alive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            snapshot_delay_ms: 1000,
            status_fallback_secs: 5,
            poll_secs: 30,
            keep_alive: false,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn snapshot_delay(&self) -> Duration {
        Duration::from_millis(self.snapshot_delay_ms)
    }

    pub fn status_fallback(&self) -> Duration {
        Duration::from_secs(self.status_fallback_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    /// Base delay used when the close reason points at a gateway fault (502).
    pub gateway_fault_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            gateway_fault_delay_ms: 5000,
            max_delay_ms: 60_000,
            multiplier: 1.5,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommandConfig {
    pub ack_timeout_secs: u64,
    pub success_linger_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 5,
            success_linger_secs: 3,
        }
    }
}

impl CommandConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn success_linger(&self) -> Duration {
        Duration::from_secs(self.success_linger_secs)
    }
}

/// The operator this client acts for.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OperatorConfig {
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

pub fn load_client_config() -> anyhow::Result<ClientConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/client").required(false))
        .add_source(
            config::Environment::with_prefix("SITELINK")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("operator.roles")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Replace template variables in a URL
pub fn expand_url(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let placeholder = format!("${{{}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_url() {
        let mut vars = HashMap::new();
        vars.insert("site_id".to_string(), "12".to_string());

        let url = "wss://gateway.example:9003/ws/device${site_id}";
        assert_eq!(expand_url(url, &vars), "wss://gateway.example:9003/ws/device12");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [reconnect]
                max_attempts = 4

                [operator]
                user_id = "42"
                roles = ["operations"]
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: ClientConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.session.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.commands.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.operator.roles, vec!["operations".to_string()]);
        assert!(!config.operator.is_admin);
    }
}
