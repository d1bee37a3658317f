use std::fmt;

/// A synthetic `(network, address)` pair — the sole routing key in the
/// Intranet. Equality is plain string equality on both components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyntheticAddr {
    network: String,
    address: String,
}

impl SyntheticAddr {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Composed `network://address` form used as the dial target string
    /// for Agent pattern matching (§4.4).
    pub fn as_url_string(&self) -> String {
        format!("{}://{}", self.network, self.address)
    }
}

impl fmt::Display for SyntheticAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_string_composes_scheme_and_host() {
        let a = SyntheticAddr::new("agent", "server.agent");
        assert_eq!(a.as_url_string(), "agent://server.agent");
    }

    #[test]
    fn equality_is_component_wise() {
        assert_eq!(
            SyntheticAddr::new("tcp", "0.0.0.0:8080"),
            SyntheticAddr::new("tcp", "0.0.0.0:8080")
        );
        assert_ne!(
            SyntheticAddr::new("tcp", "0.0.0.0:8080"),
            SyntheticAddr::new("udp", "0.0.0.0:8080")
        );
    }
}
