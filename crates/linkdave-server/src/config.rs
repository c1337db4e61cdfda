/// Listener addresses, read from the environment. A leading-colon value
/// (`:8080`) binds every interface on that port.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_addr: String,
    pub http_addr: String,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            ws_addr: normalize_addr(&env_or("LINKDAVE_WS_PORT", ":8080")),
            http_addr: normalize_addr(&env_or("LINKDAVE_HTTP_PORT", ":8081")),
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn normalize_addr(raw: &str) -> String {
    if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_port_binds_all_interfaces() {
        assert_eq!(normalize_addr(":8080"), "0.0.0.0:8080");
    }

    #[test]
    fn explicit_addr_passes_through() {
        assert_eq!(normalize_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }
}
