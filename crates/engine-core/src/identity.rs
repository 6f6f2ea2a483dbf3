use std::path::PathBuf;

use rand::Rng;
use url::Url;

/// Immutable-for-process-lifetime identity of this worker.
#[derive(Debug, Clone)]
pub struct EngineIdentity {
    /// Stable identifier reported to the dispatcher, e.g. `engine-4821`.
    pub engine_id: String,
    /// Reported hostname (overridden or system-resolved).
    pub hostname: String,
    /// Dispatcher base URL.
    pub dispatch_base_url: Url,
    /// Shared secret sent as `X-API-Key`, if configured.
    pub api_key: Option<String>,
    /// CA bundle used to verify the dispatcher's TLS certificate.
    pub ca_cert_path: Option<PathBuf>,
    /// Advertised local storage capacity in GB.
    pub storage_capacity_gb: f64,
    /// Whether this worker supports streaming transcodes.
    pub streaming_support: bool,
}

impl EngineIdentity {
    /// Default advertised storage capacity when not otherwise configured.
    pub const DEFAULT_STORAGE_CAPACITY_GB: f64 = 100.0;

    /// Generates a process-lifetime engine id of the form `engine-<4-digit decimal>`.
    pub fn generate_engine_id() -> String {
        let n: u32 = rand::thread_rng().gen_range(0..10_000);
        format!("engine-{n:04}")
    }

    /// Resolves the reported hostname: an explicit override, else the system
    /// hostname, else `"unknown"`.
    pub fn resolve_hostname(override_hostname: Option<String>) -> String {
        if let Some(name) = override_hostname {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }

        hostname::get()
            .ok()
            .and_then(|os| os.into_string().ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_engine_id_has_expected_shape() {
        for _ in 0..50 {
            let id = EngineIdentity::generate_engine_id();
            assert!(id.starts_with("engine-"));
            let digits = &id["engine-".len()..];
            assert_eq!(digits.len(), 4);
            assert!(digits.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn resolve_hostname_prefers_override() {
        assert_eq!(
            EngineIdentity::resolve_hostname(Some("custom-host".to_string())),
            "custom-host"
        );
    }

    #[test]
    fn resolve_hostname_ignores_blank_override() {
        let resolved = EngineIdentity::resolve_hostname(Some("   ".to_string()));
        assert!(!resolved.is_empty());
    }
}
