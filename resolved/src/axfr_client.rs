//! A minimal AXFR client: refreshes `secondary` zones from their
//! configured remote at startup.
//!
//! Mirrors the shape of [`crate::server`]'s own AXFR responder, which
//! streams a whole zone as a single TCP message rather than the
//! multi-message form RFC 5936 also allows -- so a single read here is
//! enough to pick it back up.

use std::io;
use std::net::ToSocketAddrs;

use tokio::net::TcpStream;

use dns_types::protocol::types::{
    DomainName, Message, Question, QueryClass, QueryType, RecordTypeWithData,
};
use dns_types::zones::types::{Zone, ZoneError, SOA};

use crate::net::{read_tcp_bytes, send_tcp_bytes};

#[derive(Debug)]
pub enum AxfrError {
    Io(io::Error),
    BadAddress(String),
    Protocol(String),
    Zone(ZoneError),
}

impl std::fmt::Display for AxfrError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AxfrError::Io(err) => write!(f, "I/O error: {err}"),
            AxfrError::BadAddress(addr) => write!(f, "could not resolve remote {addr:?}"),
            AxfrError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            AxfrError::Zone(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for AxfrError {}

/// Connect to `remote` (host:port, defaulting to port 53 if bare) and
/// pull the whole zone for `origin` via AXFR.
pub async fn fetch_zone(origin: &DomainName, remote: &str) -> Result<Zone, AxfrError> {
    let addr_str = if remote.contains(':') {
        remote.to_string()
    } else {
        format!("{remote}:53")
    };
    let addr = addr_str
        .to_socket_addrs()
        .map_err(AxfrError::Io)?
        .next()
        .ok_or_else(|| AxfrError::BadAddress(remote.to_string()))?;

    let mut stream = TcpStream::connect(addr).await.map_err(AxfrError::Io)?;

    let query = Message::from_question(
        1,
        Question {
            name: origin.clone(),
            qtype: QueryType::AXFR,
            qclass: QueryClass::Record(dns_types::protocol::types::RecordClass::IN),
        },
    );
    let bytes = query
        .to_octets()
        .map_err(|err| AxfrError::Protocol(format!("{err:?}")))?;
    send_tcp_bytes(&mut stream, &bytes)
        .await
        .map_err(AxfrError::Io)?;

    let raw = read_tcp_bytes(&mut stream)
        .await
        .map_err(|err| AxfrError::Protocol(format!("{err:?}")))?;
    let response =
        Message::from_octets(&raw).map_err(|err| AxfrError::Protocol(format!("{err:?}")))?;

    if response.header.rcode != dns_types::protocol::types::Rcode::NoError {
        return Err(AxfrError::Protocol(format!(
            "remote refused AXFR: {:?}",
            response.header.rcode
        )));
    }

    let mut answers = response.answers.into_iter();
    let first = answers
        .next()
        .ok_or_else(|| AxfrError::Protocol("empty AXFR response".to_string()))?;
    let soa = soa_of(&first).ok_or_else(|| AxfrError::Protocol("AXFR did not start with SOA".to_string()))?;

    let rest: Vec<_> = answers.collect();
    let (last, body) = rest
        .split_last()
        .ok_or_else(|| AxfrError::Protocol("AXFR had no closing SOA".to_string()))?;
    if soa_of(last).is_none() {
        return Err(AxfrError::Protocol("AXFR did not end with SOA".to_string()));
    }

    let records = body
        .iter()
        .map(|rr| (rr.name.clone(), rr.rtype_with_data.clone(), rr.ttl));

    Zone::build(origin.clone(), soa, records).map_err(AxfrError::Zone)
}

fn soa_of(rr: &dns_types::protocol::types::ResourceRecord) -> Option<SOA> {
    match &rr.rtype_with_data {
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
    }
}
