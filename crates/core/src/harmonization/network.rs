//! Network types: IP addresses and networks, domain names, URLs, AS numbers.
//!
//! When a host string could be read as either an IP literal or a domain
//! name, the IP reading always wins (see [`split_host`]). `FQDN` therefore
//! rejects every IP literal; such values belong in an `IPAddress` field.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::{HarmonizationType, trimmed_str};
use crate::error::SanitizeError;

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?\.)*[a-z0-9_](?:[a-z0-9_-]{0,61}[a-z0-9_])?$")
        .expect("domain pattern is valid")
});

const MAX_DOMAIN_LEN: usize = 253;

/// A host split by the IP-before-domain rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    /// The host is an IP literal.
    Ip(IpAddr),
    /// The host is a (lower-cased, IDNA-encoded) domain name.
    Domain(String),
}

/// Classifies a host string: IP literal first, domain name otherwise.
///
/// Returns `None` when the string is neither.
pub fn split_host(host: &str) -> Option<HostValue> {
    let host = host.trim();
    if let Some(ip) = parse_ip_literal(host) {
        return Some(HostValue::Ip(ip));
    }
    Fqdn::normalize(host).ok().map(HostValue::Domain)
}

/// Parses a plain or bracketed IP literal.
fn parse_ip_literal(text: &str) -> Option<IpAddr> {
    let unbracketed = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(text);
    unbracketed.parse::<IpAddr>().ok()
}

/// Splits `addr/prefix`, checking the prefix length against the family.
fn parse_cidr(text: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => (addr.parse::<IpAddr>().ok()?, prefix.parse::<u8>().ok()?),
        None => {
            let addr = text.parse::<IpAddr>().ok()?;
            (addr, max_prefix(&addr))
        }
    };
    (prefix <= max_prefix(&addr)).then_some((addr, prefix))
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Zeroes the host bits of `addr`.
fn network_address(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
        }
        IpAddr::V6(v6) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// Single IPv4 or IPv6 addresses, in canonical textual form.
pub struct IpAddress;

impl IpAddress {
    /// Parses any accepted input form into an address.
    pub fn parse(value: &Value) -> Option<IpAddr> {
        match value {
            Value::String(s) => {
                let text = s.trim();
                if let Some(ip) = parse_ip_literal(text) {
                    return Some(ip);
                }
                // a network holding exactly one address
                let (addr, prefix) = parse_cidr(text)?;
                (prefix == max_prefix(&addr)).then_some(addr)
            }
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
            _ => None,
        }
    }

    /// Integer value of an address.
    pub fn to_int(value: &str) -> Option<u128> {
        match value.trim().parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => Some(u128::from(u32::from(v4))),
            IpAddr::V6(v6) => Some(u128::from(v6)),
        }
    }

    /// IP version (4 or 6).
    pub fn version(value: &str) -> Option<u8> {
        match value.trim().parse::<IpAddr>().ok()? {
            IpAddr::V4(_) => Some(4),
            IpAddr::V6(_) => Some(6),
        }
    }

    /// Reverse DNS name (`in-addr.arpa.` / `ip6.arpa.`).
    pub fn to_reverse(value: &str) -> Option<String> {
        match value.trim().parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                Some(format!("{d}.{c}.{b}.{a}.in-addr.arpa."))
            }
            IpAddr::V6(v6) => {
                let nibbles: Vec<String> = format!("{:032x}", u128::from(v6))
                    .chars()
                    .rev()
                    .map(String::from)
                    .collect();
                Some(format!("{}.ip6.arpa.", nibbles.join(".")))
            }
        }
    }
}

impl HarmonizationType for IpAddress {
    fn type_name(&self) -> &str {
        "IPAddress"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        Self::parse(value)
            .map(|ip| Value::String(ip.to_string()))
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not an IP address"))
    }
}

/// CIDR networks, normalized to their network address.
pub struct IpNetwork;

impl IpNetwork {
    /// IP version of a network (4 or 6).
    pub fn version(value: &str) -> Option<u8> {
        parse_cidr(value.trim()).map(|(addr, _)| match addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        })
    }
}

impl HarmonizationType for IpNetwork {
    fn type_name(&self) -> &str {
        "IPNetwork"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let (addr, prefix) = trimmed_str(value)
            .and_then(parse_cidr)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not an IP network"))?;
        Ok(Value::String(format!("{}/{prefix}", network_address(addr, prefix))))
    }
}

/// Fully qualified domain names: lower-cased, IDNA-encoded, no trailing dot.
///
/// IP literals and URLs are rejected.
pub struct Fqdn;

impl Fqdn {
    /// Normalizes a domain name or explains why it is not one.
    pub fn normalize(text: &str) -> Result<String, &'static str> {
        let text = text.trim().trim_end_matches('.');
        if text.is_empty() {
            return Err("empty domain name");
        }
        if parse_ip_literal(text).is_some() {
            return Err("IP literals are not domain names");
        }
        if text.contains("://") || text.contains('/') || text.contains(':') {
            return Err("URLs are not domain names");
        }
        let domain = match url::Host::parse(text) {
            Ok(url::Host::Domain(domain)) => domain,
            Ok(_) => return Err("IP literals are not domain names"),
            Err(_) => return Err("invalid domain name"),
        };
        if domain.len() > MAX_DOMAIN_LEN || !DOMAIN_RE.is_match(&domain) {
            return Err("invalid domain name");
        }
        Ok(domain)
    }
}

impl HarmonizationType for Fqdn {
    fn type_name(&self) -> &str {
        "FQDN"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let text = trimmed_str(value)
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "expected a string"))?;
        Self::normalize(text)
            .map(Value::String)
            .map_err(|reason| SanitizeError::new(self.type_name(), value, reason))
    }
}

/// URLs with a host, normalized by the WHATWG URL rules.
///
/// Defanged `hxxp://` / `hxxps://` schemes are restored and a missing
/// scheme defaults to `http://`.
pub struct Url;

impl Url {
    fn parse_with_host(text: &str) -> Option<url::Url> {
        url::Url::parse(text)
            .ok()
            .filter(|u| u.host_str().is_some_and(|h| !h.is_empty()))
    }

    /// Parses any accepted input form.
    pub fn parse(text: &str) -> Option<url::Url> {
        let text = text.trim();
        let refanged = if let Some(rest) = strip_prefix_ignore_case(text, "hxxps://") {
            format!("https://{rest}")
        } else if let Some(rest) = strip_prefix_ignore_case(text, "hxxp://") {
            format!("http://{rest}")
        } else {
            text.to_owned()
        };
        Self::parse_with_host(&refanged).or_else(|| Self::parse_with_host(&format!("http://{refanged}")))
    }

    /// Domain name of the URL host, if the host is not an IP literal.
    pub fn to_domain_name(value: &str) -> Option<String> {
        match Self::parse(value)?.host()? {
            url::Host::Domain(domain) => Some(domain.to_owned()),
            _ => None,
        }
    }

    /// IP address of the URL host, if the host is an IP literal.
    pub fn to_ip(value: &str) -> Option<IpAddr> {
        match Self::parse(value)?.host()? {
            url::Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
            url::Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
            url::Host::Domain(_) => None,
        }
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

impl HarmonizationType for Url {
    fn type_name(&self) -> &str {
        "URL"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        trimmed_str(value)
            .and_then(Self::parse)
            .map(|u| Value::String(u.into()))
            .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not a URL with a host"))
    }
}

/// Autonomous system numbers, `1..=4294967295`. `"AS64496"` is accepted.
pub struct Asn;

impl Asn {
    const MAX: i64 = 4_294_967_295;

    /// Returns whether `asn` is inside the valid range.
    pub fn in_range(asn: i64) -> bool {
        (1..=Self::MAX).contains(&asn)
    }
}

impl HarmonizationType for Asn {
    fn type_name(&self) -> &str {
        "ASN"
    }

    fn sanitize(&self, value: &Value) -> Result<Value, SanitizeError> {
        let asn = match value {
            Value::String(s) => {
                let text = s.trim();
                let digits = strip_prefix_ignore_case(text, "as").unwrap_or(text);
                digits.trim().parse::<i64>().ok()
            }
            other => super::Integer::parse(other),
        }
        .ok_or_else(|| SanitizeError::new(self.type_name(), value, "not an AS number"))?;

        if !Self::in_range(asn) {
            return Err(SanitizeError::new(self.type_name(), value, "AS number out of range"));
        }
        Ok(Value::from(asn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ip_address_normalizes() {
        assert_eq!(IpAddress.sanitize(&json!(" 1.2.3.4 ")).unwrap(), json!("1.2.3.4"));
        assert_eq!(
            IpAddress.sanitize(&json!("2001:DB8:0:0::1")).unwrap(),
            json!("2001:db8::1")
        );
        assert_eq!(IpAddress.sanitize(&json!("10.0.0.1/32")).unwrap(), json!("10.0.0.1"));
        assert_eq!(IpAddress.sanitize(&json!(16_909_060)).unwrap(), json!("1.2.3.4"));
        assert!(IpAddress.sanitize(&json!("10.0.0.0/8")).is_err());
        assert!(IpAddress.sanitize(&json!("example.org")).is_err());
        assert!(IpAddress.is_valid(&json!("1.2.3.4")));
        assert!(!IpAddress.is_valid(&json!(" 1.2.3.4")));
    }

    #[test]
    fn ip_address_helpers() {
        assert_eq!(IpAddress::to_int("1.2.3.4"), Some(16_909_060));
        assert_eq!(IpAddress::version("::1"), Some(6));
        assert_eq!(
            IpAddress::to_reverse("192.0.2.1").as_deref(),
            Some("1.2.0.192.in-addr.arpa.")
        );
        let reverse = IpAddress::to_reverse("2001:db8::1").unwrap();
        assert!(reverse.starts_with("1.0.0.0."));
        assert!(reverse.ends_with(".8.b.d.0.1.0.0.2.ip6.arpa."));
    }

    #[test]
    fn ip_network_masks_host_bits() {
        assert_eq!(IpNetwork.sanitize(&json!("192.0.2.77/24")).unwrap(), json!("192.0.2.0/24"));
        assert_eq!(IpNetwork.sanitize(&json!("10.1.1.1")).unwrap(), json!("10.1.1.1/32"));
        assert_eq!(IpNetwork.sanitize(&json!("2001:db8::1/32")).unwrap(), json!("2001:db8::/32"));
        assert!(IpNetwork.sanitize(&json!("10.0.0.0/33")).is_err());
        assert_eq!(IpNetwork::version("10.0.0.0/8"), Some(4));
    }

    #[test]
    fn fqdn_rejects_ip_literals() {
        for ip in ["93.184.216.34", "::1", "2001:db8::1", "[::1]"] {
            assert!(Fqdn.sanitize(&json!(ip)).is_err(), "{ip} accepted as FQDN");
        }
    }

    #[test]
    fn fqdn_normalizes() {
        assert_eq!(Fqdn.sanitize(&json!("Example.ORG.")).unwrap(), json!("example.org"));
        assert_eq!(Fqdn.sanitize(&json!("localhost")).unwrap(), json!("localhost"));
        assert_eq!(
            Fqdn.sanitize(&json!("bücher.example")).unwrap(),
            json!("xn--bcher-kva.example")
        );
        assert!(Fqdn.sanitize(&json!("http://example.org")).is_err());
        assert!(Fqdn.sanitize(&json!("exa mple.org")).is_err());
        assert!(Fqdn.sanitize(&json!("-bad.example")).is_err());
        assert!(Fqdn.sanitize(&json!("")).is_err());
    }

    #[test]
    fn split_host_prefers_ip() {
        assert_eq!(
            split_host("10.0.0.1"),
            Some(HostValue::Ip("10.0.0.1".parse().unwrap()))
        );
        assert_eq!(
            split_host("Example.org"),
            Some(HostValue::Domain("example.org".to_owned()))
        );
        assert_eq!(split_host("not a host"), None);
    }

    #[test]
    fn url_refangs_and_adds_scheme() {
        assert_eq!(
            Url.sanitize(&json!("hxxp://example.org/a b")).unwrap(),
            json!("http://example.org/a%20b")
        );
        assert_eq!(
            Url.sanitize(&json!("example.org/path")).unwrap(),
            json!("http://example.org/path")
        );
        assert_eq!(
            Url.sanitize(&json!("HTTPS://EXAMPLE.org")).unwrap(),
            json!("https://example.org/")
        );
        assert!(Url.sanitize(&json!("")).is_err());
    }

    #[test]
    fn url_host_helpers() {
        assert_eq!(
            Url::to_domain_name("http://www.example.org/x").as_deref(),
            Some("www.example.org")
        );
        assert_eq!(Url::to_domain_name("http://10.0.0.1/x"), None);
        assert_eq!(Url::to_ip("http://10.0.0.1/x"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(Url::to_ip("http://example.org/"), None);
    }

    #[test]
    fn url_is_idempotent() {
        let once = Url.sanitize(&json!("hxxps://Example.org/a?b=c d#frag")).unwrap();
        assert_eq!(Url.sanitize(&once).unwrap(), once);
        assert!(Url.is_valid(&once));
    }

    #[test]
    fn asn_range_and_prefix() {
        assert_eq!(Asn.sanitize(&json!("AS64496")).unwrap(), json!(64496));
        assert_eq!(Asn.sanitize(&json!(" as 3320")).unwrap(), json!(3320));
        assert_eq!(Asn.sanitize(&json!(4_294_967_295_u64)).unwrap(), json!(4_294_967_295_u64));
        assert!(Asn.sanitize(&json!(0)).is_err());
        assert!(Asn.sanitize(&json!(4_294_967_296_u64)).is_err());
        assert!(Asn.sanitize(&json!("ASX")).is_err());
    }
}
