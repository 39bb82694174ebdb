#![forbid(unsafe_code)]

pub mod secret {
	use core::fmt;

	/// Owned secret value that never appears in logs or serialized output.
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

	impl serde::Serialize for SecretString {
		fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
		where
			S: serde::Serializer,
		{
			serializer.serialize_str("")
		}
	}

	impl<'de> serde::Deserialize<'de> for SecretString {
		fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
		where
			D: serde::Deserializer<'de>,
		{
			let s = String::deserialize(deserializer)?;
			Ok(SecretString::new(s))
		}
	}

}

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse a bind endpoint string in the form `ws://host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let rest = s
				.strip_prefix("ws://")
				.ok_or_else(|| format!("invalid endpoint (expected ws://host:port): {s}"))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected ws://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:9030): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

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
		fn parses_dns_hostname() {
			let e = WsEndpoint::parse("ws://parley.example.com:443").unwrap();
			assert_eq!(e.host, "parley.example.com");
			assert_eq!(e.port, 443);
			assert_eq!(e.hostport(), "parley.example.com:443");
		}

		#[test]
		fn parses_ipv4_and_bracketed_ipv6() {
			let e4 = WsEndpoint::parse("ws://127.0.0.1:9030").unwrap();
			assert_eq!(e4.to_socket_addr_if_ip_literal().unwrap().to_string(), "127.0.0.1:9030");

			let e6 = WsEndpoint::parse("ws://[::1]:9030").unwrap();
			assert_eq!(e6.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:9030");
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = WsEndpoint::parse("ws://::1:9030").unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn rejects_path_query_fragment() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:9030/").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:9030?room=r1").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1:9030#frag").is_err());
		}

		#[test]
		fn rejects_port_zero_missing_port_and_wrong_scheme() {
			assert!(WsEndpoint::parse("ws://127.0.0.1:0").is_err());
			assert!(WsEndpoint::parse("ws://127.0.0.1").is_err());
			assert!(WsEndpoint::parse("http://127.0.0.1:9030").is_err());
		}

		#[test]
		fn to_socket_addr_if_ip_literal_rejects_dns() {
			let e = WsEndpoint::parse("ws://parley.example.com:443").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
