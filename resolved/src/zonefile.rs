//! A minimal master-file (RFC 1035 section 5) tokenizer: the external
//! collaborator `dns_types::zones::types::Zone` assumes exists to turn
//! text records into `(name, type, class, ttl, rdata)` tuples it can
//! insert.
//!
//! Supports `$ORIGIN`, blank-owner-repeats-previous, and the record
//! types needed to stand up a zone: SOA, NS, A, AAAA, CNAME, DNAME,
//! MX, TXT, SRV, PTR.  Comments start with `;` and run to end of line.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use dns_types::protocol::types::*;
use dns_types::zones::types::{Zone, ZoneError, SOA};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneFileError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ZoneFileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ZoneFileError {}

struct Record {
    name: DomainName,
    ttl: u32,
    rtype_with_data: RecordTypeWithData,
}

/// Parse a master-file, applying `origin` as the initial `$ORIGIN`
/// and building a validated `Zone` from the `SOA` plus every other
/// record.
pub fn parse(origin: &DomainName, text: &str) -> Result<Zone, ZoneFileError> {
    let records = tokenize(origin, text)?;

    let soa = records
        .iter()
        .find_map(|r| match &r.rtype_with_data {
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => Some(SOA {
                mname: mname.clone(),
                rname: rname.clone(),
                serial: *serial,
                refresh: *refresh,
                retry: *retry,
                expire: *expire,
                minimum: *minimum,
            }),
            _ => None,
        })
        .ok_or(ZoneFileError {
            line: 0,
            message: "no SOA record".to_string(),
        })?;

    let others = records
        .into_iter()
        .filter(|r| !matches!(r.rtype_with_data, RecordTypeWithData::SOA { .. }))
        .map(|r| (r.name, r.rtype_with_data, r.ttl));

    Zone::build(origin.clone(), soa, others).map_err(|err| ZoneFileError {
        line: 0,
        message: zone_error_message(err),
    })
}

fn zone_error_message(err: ZoneError) -> String {
    match err {
        ZoneError::MissingNs { apex } => {
            format!("zone apex {} has no NS records", apex.to_dotted_string())
        }
    }
}

fn tokenize(origin: &DomainName, text: &str) -> Result<Vec<Record>, ZoneFileError> {
    let mut records = Vec::new();
    let mut current_origin = origin.clone();
    let mut last_name: Option<DomainName> = None;
    let mut default_ttl: u32 = 3600;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim_end();
        if line.trim().is_empty() {
            continue;
        }

        if let Some(rest) = line.trim_start().strip_prefix("$ORIGIN") {
            let name = rest.trim();
            current_origin = DomainName::from_dotted_string(name).ok_or(ZoneFileError {
                line: line_no,
                message: format!("invalid $ORIGIN {name:?}"),
            })?;
            continue;
        }
        if let Some(rest) = line.trim_start().strip_prefix("$TTL") {
            let value = rest.trim();
            default_ttl = value.parse().map_err(|_| ZoneFileError {
                line: line_no,
                message: format!("invalid $TTL {value:?}"),
            })?;
            continue;
        }

        let owner_blank = line.starts_with(char::is_whitespace);
        let mut fields = line.split_whitespace().peekable();

        let name = if owner_blank {
            last_name.clone().ok_or(ZoneFileError {
                line: line_no,
                message: "record has no owner and none precedes it".to_string(),
            })?
        } else {
            let raw = fields.next().ok_or(ZoneFileError {
                line: line_no,
                message: "empty record".to_string(),
            })?;
            resolve_name(raw, &current_origin, line_no)?
        };
        last_name = Some(name.clone());

        let mut ttl = default_ttl;
        let mut class = RecordClass::IN;
        let mut rtype_token = None;

        for _ in 0..3 {
            let Some(&tok) = fields.peek() else { break };
            if let Ok(n) = tok.parse::<u32>() {
                ttl = n;
                fields.next();
            } else if let Ok(c) = RecordClass::from_str(tok) {
                class = c;
                fields.next();
            } else if RecordType::from_str(tok).is_ok() {
                rtype_token = Some(tok);
                fields.next();
                break;
            } else {
                break;
            }
        }
        let _ = class;

        let rtype_token = rtype_token.ok_or(ZoneFileError {
            line: line_no,
            message: "missing record type".to_string(),
        })?;
        let rdata: Vec<&str> = fields.collect();

        let rtype_with_data = parse_rdata(rtype_token, &rdata, &current_origin, line_no)?;
        records.push(Record {
            name,
            ttl,
            rtype_with_data,
        });
    }

    Ok(records)
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn resolve_name(
    raw: &str,
    origin: &DomainName,
    line: usize,
) -> Result<DomainName, ZoneFileError> {
    if raw == "@" {
        return Ok(origin.clone());
    }
    if raw.ends_with('.') {
        return DomainName::from_dotted_string(raw).ok_or(ZoneFileError {
            line,
            message: format!("invalid name {raw:?}"),
        });
    }
    let relative = DomainName::from_dotted_string(&format!("{raw}.")).ok_or(ZoneFileError {
        line,
        message: format!("invalid name {raw:?}"),
    })?;
    relative.make_subdomain_of(origin).ok_or(ZoneFileError {
        line,
        message: format!("name {raw:?} too long once qualified"),
    })
}

fn parse_rdata(
    rtype: &str,
    fields: &[&str],
    origin: &DomainName,
    line: usize,
) -> Result<RecordTypeWithData, ZoneFileError> {
    let err = |message: String| ZoneFileError { line, message };
    let name_field = |raw: &str| resolve_name(raw, origin, line);

    match rtype {
        "A" => {
            let addr = fields
                .first()
                .and_then(|s| Ipv4Addr::from_str(s).ok())
                .ok_or_else(|| err(format!("invalid A address on line {line}")))?;
            Ok(RecordTypeWithData::A { address: addr })
        }
        "AAAA" => {
            let addr = fields
                .first()
                .and_then(|s| Ipv6Addr::from_str(s).ok())
                .ok_or_else(|| err(format!("invalid AAAA address on line {line}")))?;
            Ok(RecordTypeWithData::AAAA { address: addr })
        }
        "NS" => {
            let nsdname = fields
                .first()
                .ok_or_else(|| err("NS record missing nsdname".to_string()))
                .and_then(|s| name_field(s))?;
            Ok(RecordTypeWithData::NS { nsdname })
        }
        "CNAME" => {
            let cname = fields
                .first()
                .ok_or_else(|| err("CNAME record missing target".to_string()))
                .and_then(|s| name_field(s))?;
            Ok(RecordTypeWithData::CNAME { cname })
        }
        "DNAME" => {
            let dname = fields
                .first()
                .ok_or_else(|| err("DNAME record missing target".to_string()))
                .and_then(|s| name_field(s))?;
            Ok(RecordTypeWithData::DNAME { dname })
        }
        "PTR" => {
            let ptrdname = fields
                .first()
                .ok_or_else(|| err("PTR record missing target".to_string()))
                .and_then(|s| name_field(s))?;
            Ok(RecordTypeWithData::PTR { ptrdname })
        }
        "MX" => {
            if fields.len() != 2 {
                return Err(err("MX record needs preference and exchange".to_string()));
            }
            let preference: u16 = fields[0]
                .parse()
                .map_err(|_| err("invalid MX preference".to_string()))?;
            let exchange = name_field(fields[1])?;
            Ok(RecordTypeWithData::MX {
                preference,
                exchange,
            })
        }
        "SRV" => {
            if fields.len() != 4 {
                return Err(err("SRV record needs priority weight port target".to_string()));
            }
            let priority: u16 = fields[0]
                .parse()
                .map_err(|_| err("invalid SRV priority".to_string()))?;
            let weight: u16 = fields[1]
                .parse()
                .map_err(|_| err("invalid SRV weight".to_string()))?;
            let port: u16 = fields[2]
                .parse()
                .map_err(|_| err("invalid SRV port".to_string()))?;
            let target = name_field(fields[3])?;
            Ok(RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            })
        }
        "TXT" => {
            let joined = fields.join(" ");
            let text = joined.trim_matches('"');
            Ok(RecordTypeWithData::TXT {
                octets: bytes::Bytes::copy_from_slice(text.as_bytes()),
            })
        }
        "SOA" => {
            if fields.len() != 7 {
                return Err(err("SOA record needs mname rname serial refresh retry expire minimum".to_string()));
            }
            let mname = name_field(fields[0])?;
            let rname = name_field(fields[1])?;
            let serial = fields[2]
                .parse()
                .map_err(|_| err("invalid SOA serial".to_string()))?;
            let refresh = fields[3]
                .parse()
                .map_err(|_| err("invalid SOA refresh".to_string()))?;
            let retry = fields[4]
                .parse()
                .map_err(|_| err("invalid SOA retry".to_string()))?;
            let expire = fields[5]
                .parse()
                .map_err(|_| err("invalid SOA expire".to_string()))?;
            let minimum = fields[6]
                .parse()
                .map_err(|_| err("invalid SOA minimum".to_string()))?;
            Ok(RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            })
        }
        other => Err(err(format!("unsupported record type {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> DomainName {
        DomainName::from_dotted_string("example.com.").unwrap()
    }

    #[test]
    fn parses_a_minimal_zone() {
        let text = "\
@ 3600 IN SOA ns1.example.com. hostmaster.example.com. 1 3600 600 86400 60
@ 3600 IN NS ns1.example.com.
ns1 3600 IN A 10.0.0.1
www 3600 IN CNAME example.com.
";
        let zone = parse(&origin(), text).unwrap();
        assert!(zone.is_authoritative());
    }

    #[test]
    fn rejects_a_zone_without_an_soa() {
        let text = "@ 3600 IN NS ns1.example.com.\n";
        assert!(parse(&origin(), text).is_err());
    }

    #[test]
    fn blank_owner_repeats_the_previous_name() {
        let text = "\
@ 3600 IN SOA ns1.example.com. hostmaster.example.com. 1 3600 600 86400 60
@ 3600 IN NS ns1.example.com.
@ 3600 IN NS ns2.example.com.
";
        let zone = parse(&origin(), text).unwrap();
        assert!(zone.is_authoritative());
    }
}
