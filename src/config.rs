use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Global configuration shared by the proxy and upstream binaries
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Upstream server settings
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Bind address for the public listener (default: 0.0.0.0)
    #[serde(default = "default_proxy_bind")]
    pub bind: String,

    /// Public listening port (default: 8080)
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Maximum time to wait for the upstream's response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum time to wait for a client to finish sending request headers
    /// in seconds (default: 30). Idle partial requests are closed after this.
    #[serde(default = "default_client_idle_timeout")]
    pub client_idle_timeout_secs: u64,

    /// Maximum idle connections kept to the upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Address the upstream binds and the proxy connects to.
    /// Must be loopback; the upstream is never reachable except via the proxy.
    #[serde(default = "default_upstream_host")]
    pub host: String,

    /// Upstream listening port (default: 3000)
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Greeting returned by `GET /` as {"message": "<greeting>"}
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid proxy bind address: {}", e))
    }
}

impl UpstreamConfig {
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid upstream address: {}", e))
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: default_proxy_bind(),
            port: default_proxy_port(),
            request_timeout_secs: default_request_timeout(),
            client_idle_timeout_secs: default_client_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            greeting: default_greeting(),
        }
    }
}

// Default value functions
fn default_proxy_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for the upstream to respond
}

fn default_client_idle_timeout() -> u64 {
    30 // 30 seconds max for a client to finish its request headers
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections to the upstream
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    3000
}

fn default_greeting() -> String {
    "Hello, World!".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the given path, falling back to defaults if the file is absent.
    /// Both binaries run with zero configuration; ports are config constants.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.proxy.port == 0 {
            anyhow::bail!("proxy.port must be greater than 0");
        }
        if self.upstream.port == 0 {
            anyhow::bail!("upstream.port must be greater than 0");
        }
        if self.proxy.port == self.upstream.port {
            anyhow::bail!("proxy.port and upstream.port must differ");
        }
        match self.upstream.host.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => {}
            Ok(_) => anyhow::bail!(
                "upstream.host '{}' must be a loopback address",
                self.upstream.host
            ),
            Err(e) => anyhow::bail!("upstream.host is not a valid IP address: {}", e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[proxy]
bind = "127.0.0.1"
port = 9080
request_timeout_secs = 5
client_idle_timeout_secs = 2

[upstream]
port = 9300
greeting = "hi there"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.proxy.bind, "127.0.0.1");
        assert_eq!(config.proxy.port, 9080);
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.proxy.client_idle_timeout(), Duration::from_secs(2));
        assert_eq!(config.upstream.port, 9300);
        assert_eq!(config.upstream.greeting, "hi there");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.proxy.bind, "0.0.0.0");
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.proxy.client_idle_timeout_secs, 30);
        assert_eq!(config.proxy.pool_max_idle_per_host, 10);
        assert_eq!(config.proxy.pool_idle_timeout_secs, 90);
        assert_eq!(config.upstream.host, "127.0.0.1");
        assert_eq!(config.upstream.port, 3000);
        assert_eq!(config.upstream.greeting, "Hello, World!");
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config: Config = toml::from_str("[proxy]\nport = 0\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("proxy.port"));
    }

    #[test]
    fn test_validate_rejects_port_collision() {
        let config: Config = toml::from_str("[proxy]\nport = 3000\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_validate_rejects_non_loopback_upstream() {
        let config: Config = toml::from_str("[upstream]\nhost = \"0.0.0.0\"\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("loopback"));
    }

    #[test]
    fn test_validate_rejects_hostname_upstream() {
        let config: Config = toml::from_str("[upstream]\nhost = \"backend.local\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_addr_helpers() {
        let config = Config::default();
        assert_eq!(
            config.upstream.addr().unwrap(),
            "127.0.0.1:3000".parse().unwrap()
        );
        assert_eq!(
            config.proxy.bind_addr().unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/hellogate.toml").unwrap();
        assert_eq!(config.proxy.port, 8080);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[upstream]\ngreeting = \"from file\"").unwrap();

        let config = Config::load_or_default(file.path()).unwrap();
        assert_eq!(config.upstream.greeting, "from file");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[upstream]\nhost = \"8.8.8.8\"").unwrap();

        assert!(Config::load_or_default(file.path()).is_err());
    }
}
