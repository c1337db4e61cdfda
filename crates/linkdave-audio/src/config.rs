/// Which source URLs a node will accept, read once from the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceConfig {
    pub http_enabled: bool,
    pub https_enabled: bool,
    pub public_ip_enabled: bool,
    pub private_ip_enabled: bool,
}

impl SourceConfig {
    pub fn from_env() -> SourceConfig {
        SourceConfig {
            http_enabled: env_bool("LINKDAVE_SOURCE_HTTP_ENABLED", false),
            https_enabled: env_bool("LINKDAVE_SOURCE_HTTPS_ENABLED", false),
            public_ip_enabled: env_bool("LINKDAVE_SOURCE_IP_ADDRESS_PUBLIC_ENABLED", false),
            private_ip_enabled: env_bool("LINKDAVE_SOURCE_IP_ADDRESS_PRIVATE_ENABLED", false),
        }
    }

    /// Accept every scheme and host. Used by embedded deployments and tests.
    pub fn permissive() -> SourceConfig {
        SourceConfig {
            http_enabled: true,
            https_enabled: true,
            public_ip_enabled: true,
            private_ip_enabled: true,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "on" => true,
            "0" | "false" | "f" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}
