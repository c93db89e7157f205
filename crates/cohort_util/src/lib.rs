#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Default listen endpoint for the cohort server.
	pub const DEFAULT_BIND_ENDPOINT: &str = "quic://127.0.0.1:18303";

	/// Parsed `quic://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct QuicEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl QuicEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal, not a DNS name: {}", self.host))
		}

		/// Parse an endpoint string in the form `quic://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected quic://host:port)".to_string());
			}

			let rest = s
				.strip_prefix("quic://")
				.ok_or_else(|| format!("invalid endpoint (expected quic://host:port): {s}"))?;

			if rest.contains(['/', '?', '#']) {
				return Err(format!("invalid endpoint (path, query and fragment are not allowed): {s}"));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host: {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!("invalid endpoint host (IPv6 must be bracketed like quic://[::1]:18303): {s}"));
			}

			let port = match port_str.trim().parse::<u16>() {
				Ok(0) | Err(_) => return Err(format!("invalid endpoint port (expected 1..=65535): {s}")),
				Ok(port) => port,
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_default_endpoint() {
			let e = QuicEndpoint::parse(DEFAULT_BIND_ENDPOINT).unwrap();
			assert_eq!(e.host, "127.0.0.1");
			assert_eq!(e.port, 18303);
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "127.0.0.1:18303");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = QuicEndpoint::parse("quic://[::1]:9000").unwrap();
			assert_eq!(e.hostport(), "[::1]:9000");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:9000");
		}

		#[test]
		fn rejects_bad_endpoints() {
			assert!(QuicEndpoint::parse("").is_err());
			assert!(QuicEndpoint::parse("tcp://127.0.0.1:1").is_err());
			assert!(QuicEndpoint::parse("quic://::1:9000").is_err());
			assert!(QuicEndpoint::parse("quic://127.0.0.1:9000/x").is_err());
			assert!(QuicEndpoint::parse("quic://127.0.0.1:0").is_err());
			assert!(QuicEndpoint::parse("quic://127.0.0.1").is_err());
		}

		#[test]
		fn dns_names_are_not_socket_addrs() {
			let e = QuicEndpoint::parse("quic://studies.example.org:443").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}

pub mod secret {
	use std::fmt;

	/// String that never shows up in logs.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn redacts_in_formatting() {
			let s = SecretString::new("hunter2");
			assert_eq!(format!("{s}"), "<redacted>");
			assert!(!format!("{s:?}").contains("hunter2"));
			assert_eq!(s.expose(), "hunter2");
		}
	}
}

pub use secret::SecretString;
