//! Proxy configuration
//! Feature flags, the proxy's public base url and the upstream service hosts

use std::time::Duration;

/// Path prefix of the todo (item polling) service
pub const TODO_PATH: &str = "/FionaTodoListProxy/";
/// Path prefix of the content delivery service
pub const CDE_PATH: &str = "/FionaCDEServiceEngine/";
/// Path prefix of the firs service
pub const FIRS_PATH: &str = "/FirsProxy/";
/// Path prefix of the device event (telemetry) service
pub const DET_PATH: &str = "/DeviceEventProxy/";

/// Process-wide feature switches
#[derive(Debug, Clone, Default)]
pub struct Features {
    /// Let devices upload logs and telemetry to the vendor
    pub allow_logs_upload: bool,
    /// Let devices fetch firmware updates
    pub allow_firmware_updates: bool,
    /// Push library items that changed to devices again
    pub download_updated_books: bool,
}

/// Upstream base urls, one per service
#[derive(Debug, Clone)]
pub struct UpstreamHosts {
    pub todo: String,
    pub cde: String,
    pub firs: String,
    pub det: String,
}

impl Default for UpstreamHosts {
    fn default() -> Self {
        Self {
            todo: "https://todo-ta-g7g.amazon.com".to_string(),
            cde: "https://cde-ta-g7g.amazon.com".to_string(),
            firs: "https://firs-ta-g7g.amazon.com".to_string(),
            det: "https://det-ta-g7g.amazon.com".to_string(),
        }
    }
}

impl UpstreamHosts {
    /// Upstream base for a request path, by service prefix
    pub fn for_path(&self, path: &str) -> Option<&str> {
        let base = if path.starts_with(TODO_PATH) {
            &self.todo
        } else if path.starts_with(CDE_PATH) {
            &self.cde
        } else if path.starts_with(FIRS_PATH) {
            &self.firs
        } else if path.starts_with(DET_PATH) {
            &self.det
        } else {
            return None;
        };
        Some(base.as_str())
    }
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub http_port: u16,
    /// Public base url of the proxy as devices see it, always ending in `/`
    pub server_url: String,
    pub features: Features,
    pub upstreams: UpstreamHosts,
    pub upstream_timeout: Duration,
    /// Identify devices by the first `X-Forwarded-For` entry instead of the peer address
    pub trust_forwarded_for: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            server_url: "http://localhost:8080/".to_string(),
            features: Features::default(),
            upstreams: UpstreamHosts::default(),
            upstream_timeout: Duration::from_secs(30),
            trust_forwarded_for: false,
        }
    }
}

/// Make sure a base url ends with exactly one slash
pub fn normalize_server_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_server_url() {
        assert_eq!(normalize_server_url("https://ksp.local"), "https://ksp.local/");
        assert_eq!(normalize_server_url("https://ksp.local//"), "https://ksp.local/");
    }

    #[test]
    fn test_upstream_for_path() {
        let hosts = UpstreamHosts::default();
        assert_eq!(hosts.for_path("/FionaTodoListProxy/getItems"), Some(hosts.todo.as_str()));
        assert_eq!(hosts.for_path("/FionaCDEServiceEngine/sync"), Some(hosts.cde.as_str()));
        assert_eq!(hosts.for_path("/FirsProxy/getNewDeviceCredentials"), Some(hosts.firs.as_str()));
        assert_eq!(hosts.for_path("/DeviceEventProxy/x"), Some(hosts.det.as_str()));
        assert_eq!(hosts.for_path("/favicon.ico"), None);
    }
}
