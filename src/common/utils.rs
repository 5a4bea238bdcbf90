//! Utility functions for failoverd

/// Split a `host:port` address. IPv6 hosts may be bracketed.
pub fn split_host_port(addr: &str) -> crate::Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| crate::Error::InvalidConfig(format!("missing port in address {}", addr)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(crate::Error::InvalidConfig(format!(
            "missing host in address {}",
            addr
        )));
    }

    let port: u16 = port
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid port in address {}", addr)))?;

    Ok((host.to_string(), port))
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Parse a comma-separated address list, dropping empty items.
pub fn parse_addrs(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("10.0.0.1:6379").unwrap(),
            ("10.0.0.1".to_string(), 6379)
        );
        assert_eq!(
            split_host_port("[::1]:6380").unwrap(),
            ("::1".to_string(), 6380)
        );
        assert!(split_host_port("10.0.0.1").is_err());
        assert!(split_host_port(":6379").is_err());
        assert!(split_host_port("host:port").is_err());
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("10.0.0.1", 6379), "10.0.0.1:6379");
        assert_eq!(join_host_port("::1", 6379), "[::1]:6379");
    }

    #[test]
    fn test_parse_addrs() {
        assert_eq!(
            parse_addrs("a:1, b:2,,c:3 "),
            vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()]
        );
        assert!(parse_addrs("").is_empty());
    }
}
