#![forbid(unsafe_code)]

// Origin gate for network attaches. An empty allow-list is unrestricted
// mode; otherwise only exact matches or localhost equivalents pass.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    #[must_use]
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    #[must_use]
    pub fn allows(&self, origin: &str) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        if self.allowed.iter().any(|a| a == origin) {
            return true;
        }

        // Local clients match any localhost entry regardless of port.
        if let Some(host) = origin_host(origin)
            && (host == "localhost" || host == "127.0.0.1")
        {
            return self
                .allowed
                .iter()
                .any(|a| a.contains("localhost") || a.contains("127.0.0.1"));
        }

        false
    }
}

fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let rest = rest.split('/').next().unwrap_or(rest);
    let host = rest.split(':').next().unwrap_or(rest);
    if host.is_empty() { None } else { Some(host) }
}
