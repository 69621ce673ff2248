//! Parses the jnamed.conf-style configuration file format: a plain
//! line-oriented list of directives, one per line, blank lines and
//! `#`-prefixed comments ignored.
//!
//! Recognised keywords: `primary <origin> <file>`, `secondary <origin>
//! <remote>`, `cache <file>`, `key [<alg>] <name> <secret>`, `port
//! <n>`, `address <ip>`.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use base64::engine::general_purpose;
use base64::Engine as _;
use dns_types::protocol::tsig::TsigKey;
use dns_types::protocol::types::DomainName;

pub const DEFAULT_PORT: u16 = 53;
pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryZone {
    pub origin: DomainName,
    pub file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryZone {
    pub origin: DomainName,
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub primaries: Vec<PrimaryZone>,
    pub secondaries: Vec<SecondaryZone>,
    pub cache_file: Option<PathBuf>,
    pub keys: Vec<TsigKey>,
    pub port: u16,
    pub address: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            primaries: Vec::new(),
            secondaries: Vec::new(),
            cache_file: None,
            keys: Vec::new(),
            port: DEFAULT_PORT,
            address: DEFAULT_ADDRESS,
        }
    }
}

/// A malformed configuration line, with its 1-indexed line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["primary", origin, file] => {
                    config.primaries.push(PrimaryZone {
                        origin: parse_origin(origin, line_no)?,
                        file: PathBuf::from(file),
                    });
                }
                ["secondary", origin, remote] => {
                    config.secondaries.push(SecondaryZone {
                        origin: parse_origin(origin, line_no)?,
                        remote: remote.to_string(),
                    });
                }
                ["cache", file] => {
                    config.cache_file = Some(PathBuf::from(file));
                }
                ["key", name, secret] => {
                    config.keys.push(parse_key(None, name, secret, line_no)?);
                }
                ["key", algorithm, name, secret] => {
                    config
                        .keys
                        .push(parse_key(Some(algorithm), name, secret, line_no)?);
                }
                ["port", n] => {
                    config.port = n.parse().map_err(|_| ConfigError {
                        line: line_no,
                        message: format!("invalid port {n:?}"),
                    })?;
                }
                ["address", ip] => {
                    config.address = IpAddr::from_str(ip).map_err(|_| ConfigError {
                        line: line_no,
                        message: format!("invalid address {ip:?}"),
                    })?;
                }
                _ => {
                    return Err(ConfigError {
                        line: line_no,
                        message: format!("unrecognised directive: {line:?}"),
                    });
                }
            }
        }

        Ok(config)
    }
}

fn parse_origin(origin: &str, line: usize) -> Result<DomainName, ConfigError> {
    DomainName::from_dotted_string(origin).ok_or_else(|| ConfigError {
        line,
        message: format!("invalid domain name {origin:?}"),
    })
}

fn parse_key(
    algorithm: Option<&str>,
    name: &str,
    secret: &str,
    line: usize,
) -> Result<TsigKey, ConfigError> {
    let name = parse_origin(name, line)?;
    let algorithm = match algorithm {
        Some(alg) => DomainName::from_dotted_string(alg).ok_or_else(|| ConfigError {
            line,
            message: format!("invalid algorithm name {alg:?}"),
        })?,
        None => DomainName::from_dotted_string("hmac-sha256.").expect("valid literal"),
    };
    let decoded = general_purpose::STANDARD
        .decode(secret)
        .map_err(|_| ConfigError {
            line,
            message: format!("invalid base64 secret {secret:?}"),
        })?;
    Ok(TsigKey {
        name,
        algorithm,
        secret: decoded.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let text = "primary example.com. /etc/resolved/example.com.zone\nport 5353\naddress 127.0.0.1\n";
        let config = ServerConfig::parse(text).unwrap();
        assert_eq!(1, config.primaries.len());
        assert_eq!(5353, config.port);
        assert_eq!(IpAddr::from_str("127.0.0.1").unwrap(), config.address);
    }

    #[test]
    fn reports_the_line_number_of_a_bad_directive() {
        let text = "primary example.com. /a\nbogus line here\n";
        let err = ServerConfig::parse(text).unwrap_err();
        assert_eq!(2, err.line);
    }

    #[test]
    fn ignores_blank_lines_and_comments() {
        let text = "# a comment\n\nport 53\n";
        let config = ServerConfig::parse(text).unwrap();
        assert_eq!(53, config.port);
    }
}
