//! URL parsing for remora:// session endpoints

use std::fmt;

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUri {
    pub host: String,
    pub port: u16,
    /// `remora://` is TLS, `remora+tcp://` is plaintext
    pub tls: bool,
}

impl fmt::Display for RemoteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "remora" } else { "remora+tcp" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

pub fn parse_remote_uri(s: &str) -> Option<RemoteUri> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let scheme_end = lower.find("://")?;
    let tls = match &lower[..scheme_end] {
        "remora" => true,
        "remora+tcp" => false,
        _ => return None,
    };
    let rest = &s_trim[scheme_end + 3..];
    let hp = rest.split('/').next().unwrap_or(rest);
    if hp.is_empty() {
        return None;
    }
    // [v6]:port
    let (host, port) = if let Some(stripped) = hp.strip_prefix('[') {
        let (h, tail) = stripped.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => DEFAULT_PORT,
        };
        (h.to_string(), port)
    } else {
        match hp.split_once(':') {
            Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
            None => (hp.to_string(), DEFAULT_PORT),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteUri { host, port, tls })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_uri() {
        let u = parse_remote_uri("remora://example.org:7000").unwrap();
        assert_eq!(u, RemoteUri { host: "example.org".into(), port: 7000, tls: true });

        let u = parse_remote_uri("REMORA+TCP://10.0.0.1").unwrap();
        assert_eq!(u.port, DEFAULT_PORT);
        assert!(!u.tls);
        assert_eq!(u.to_string(), "remora+tcp://10.0.0.1:9031");

        let u = parse_remote_uri("remora://[::1]:9100/ignored").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.port, 9100);
    }

    #[test]
    fn test_parse_remote_uri_rejects() {
        assert!(parse_remote_uri("http://h:1").is_none());
        assert!(parse_remote_uri("remora://").is_none());
        assert!(parse_remote_uri("remora://h:notaport").is_none());
        assert!(parse_remote_uri("h:9031").is_none());
    }
}
