use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// An identifier a certificate can be requested for.
///
/// Only `dns` ([RFC 8555 §9.7.7]) and `ip` ([RFC 8738]) types are understood.
///
/// [RFC 8555 §9.7.7]: https://datatracker.ietf.org/doc/html/rfc8555#section-9.7.7
/// [RFC 8738]: https://datatracker.ietf.org/doc/html/rfc8738
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self {
            _type: "ip".to_owned(),
            value: addr.to_string(),
        }
    }

    pub fn is_type_dns(&self) -> bool {
        self._type == "dns"
    }

    pub fn is_type_ip(&self) -> bool {
        self._type == "ip"
    }

    /// Returns true for a DNS identifier of the form `*.example.com`.
    pub fn is_wildcard(&self) -> bool {
        self.is_type_dns() && self.value.starts_with("*.")
    }

    /// Domain name with any wildcard label removed.
    pub fn base_domain(&self) -> &str {
        self.value.strip_prefix("*.").unwrap_or(&self.value)
    }

    /// Parsed address of an `ip` identifier.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        if self.is_type_ip() {
            self.value.parse().ok()
        } else {
            None
        }
    }
}
