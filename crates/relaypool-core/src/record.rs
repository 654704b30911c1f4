use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Socks5,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(anyhow!("unknown protocol: {}", other)),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProxyRecord
// ---------------------------------------------------------------------------

/// A discovered upstream proxy, the only durable entity.
///
/// `protocol = None` means the wire protocol was never determined; such a
/// record serializes with an empty protocol field and is never selectable.
/// `updated = None` marks a record that never passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub ip: String,
    /// Numeric string, 1..65535. Kept as text because every listing source
    /// delivers it that way and the key format embeds it verbatim.
    pub port: String,
    #[serde(with = "protocol_field", default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        ProxyRecord {
            ip: ip.into(),
            port: port.into(),
            protocol: None,
            disable: false,
            updated: None,
        }
    }

    /// `ip:port`, the dial address of the upstream itself.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Store key: `{protocol}://{ip}:{port}`. A protocol change therefore
    /// produces a new key; the record under the old key ages out.
    pub fn key(&self) -> String {
        format!(
            "{}://{}:{}",
            self.protocol.map(|p| p.as_str()).unwrap_or(""),
            self.ip,
            self.port
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| anyhow!("failed to encode record: {}", e))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| anyhow!("failed to decode record: {}", e))
    }

    /// Eligible for selection: not disabled and validated at least once.
    pub fn is_selectable(&self) -> bool {
        !self.disable && self.updated.is_some()
    }
}

impl std::fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Serialize `Option<Protocol>` as its lowercase name, `None` as `""`.
mod protocol_field {
    use super::Protocol;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(p: &Option<Protocol>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(p.map(|p| p.as_str()).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Protocol>, D::Error> {
        let s = String::deserialize(d)?;
        if s.is_empty() {
            return Ok(None);
        }
        Protocol::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProxyRecord {
        ProxyRecord {
            ip: "203.0.113.7".into(),
            port: "3128".into(),
            protocol: Some(Protocol::Socks5),
            disable: false,
            updated: Some(Utc::now()),
        }
    }

    #[test]
    fn test_key_derivation() {
        let r = sample();
        assert_eq!(r.key(), "socks5://203.0.113.7:3128");
        assert_eq!(r.address(), "203.0.113.7:3128");
    }

    #[test]
    fn test_key_with_undetermined_protocol() {
        let r = ProxyRecord::new("203.0.113.7", "3128");
        assert_eq!(r.key(), "://203.0.113.7:3128");
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let r = sample();
        let bytes = r.encode().unwrap();
        let back = ProxyRecord::decode(&bytes).unwrap();
        assert_eq!(back, r);
        // encode(decode(v)) == v
        assert_eq!(back.encode().unwrap(), bytes);
    }

    #[test]
    fn test_decode_empty_protocol() {
        let r = ProxyRecord::decode(
            br#"{"ip":"1.2.3.4","port":"80","protocol":"","disable":false,"updated":null}"#,
        )
        .unwrap();
        assert_eq!(r.protocol, None);
        assert!(!r.is_selectable());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ProxyRecord::decode(b"not json").is_err());
        assert!(ProxyRecord::decode(br#"{"ip":"1.2.3.4","port":"80","protocol":"gopher"}"#).is_err());
    }

    #[test]
    fn test_selectable() {
        let mut r = sample();
        assert!(r.is_selectable());
        r.disable = true;
        assert!(!r.is_selectable());
        r.disable = false;
        r.updated = None;
        assert!(!r.is_selectable());
    }

    #[test]
    fn test_updated_roundtrips_as_rfc3339() {
        let r = sample();
        let json: serde_json::Value = serde_json::from_slice(&r.encode().unwrap()).unwrap();
        let s = json["updated"].as_str().unwrap();
        assert!(s.contains('T'), "expected RFC3339 timestamp, got {}", s);
    }
}
