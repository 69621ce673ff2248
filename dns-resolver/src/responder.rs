//! Turning a decoded query into an encoded reply.
//!
//! A `Responder` owns no state of its own beyond an optional TSIG
//! keyring/signer pair; the zone store and cache it answers from are
//! borrowed per-call, and a fresh [`Context`] tracks the CNAME/DNAME
//! chase for a single query.

use bytes::{Bytes, BytesMut};

use dns_types::protocol::serialise::WritableBuffer;
use dns_types::protocol::tsig::{TsigError, TsigKey, TsigKeyring, TsigSigner};
use dns_types::protocol::types::*;
use dns_types::rrset::{Credibility, RRset};
use dns_types::zones::types::{Zone, ZoneResult, Zones};

use crate::cache::{LookupResult, SharedCache};
use crate::context::Context;
use crate::metrics::Metrics;

/// How many CNAME/DNAME indirections (or zone delegations chased
/// for glue) a single question may incur before the responder gives
/// up and answers with whatever it has assembled so far.
const CHASE_LIMIT: usize = 6;

/// The minimum UDP payload size this responder will ever offer or
/// honour (RFC 1035 section 2.3.4, before EDNS0).
const MINIMUM_UDP_PAYLOAD: u16 = 512;

/// The UDP payload size this responder advertises in its own OPT
/// record, echoed back regardless of what the client asked for.
const OUR_UDP_PAYLOAD: u16 = 4096;

/// TCP responses are bounded only by the 2-octet length prefix of the
/// DNS-over-TCP framing.
const MAX_TCP_LENGTH: usize = 65535;

/// Which socket kind a query arrived on, since it changes both the
/// length cap and whether truncation is even meaningful.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Internal failure a `Responder` can hit while composing a reply.
///
/// Never escapes `handle_query`: every variant is caught and turned into
/// an appropriate wire-level rcode, but is still a real typed error
/// rather than a bare `()` so the reason is loggable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponderError {
    /// A TSIG-signed query carried no known key, or its MAC didn't
    /// verify.
    TsigVerificationFailed,
}

impl std::fmt::Display for ResponderError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResponderError::TsigVerificationFailed => write!(f, "TSIG verification failed"),
        }
    }
}

impl std::error::Error for ResponderError {}

/// Answers queries against a zone store and cache, chasing CNAME and
/// DNAME indirection and filling in glue, optionally under TSIG.
pub struct Responder<'k, 's> {
    keyring: Option<&'k dyn TsigKeyring>,
    signer: Option<&'s dyn TsigSigner>,
}

impl<'k, 's> Responder<'k, 's> {
    /// A responder with no TSIG support: any query carrying a TSIG
    /// record is refused with FORMERR, as if the key were unknown.
    pub fn new() -> Self {
        Self {
            keyring: None,
            signer: None,
        }
    }

    /// A responder which verifies and signs with the given keyring
    /// and MAC implementation.
    pub fn with_tsig(keyring: &'k dyn TsigKeyring, signer: &'s dyn TsigSigner) -> Self {
        Self {
            keyring: Some(keyring),
            signer: Some(signer),
        }
    }

    /// Process one received datagram or TCP segment.  `raw` is the
    /// bytes `query` was decoded from, needed to verify a TSIG MAC.
    ///
    /// Returns `None` if the query must be dropped silently (it was
    /// itself a response); otherwise returns the wire bytes of a
    /// reply, which is always well-formed even when something went
    /// wrong internally.
    pub fn handle_query(
        &self,
        zones: &Zones,
        cache: &SharedCache,
        query: &Message,
        raw: &[u8],
        transport: Transport,
    ) -> (Metrics, Option<BytesMut>) {
        let _span = tracing::error_span!("handle_query", id = query.header.id).entered();

        if query.header.is_response {
            tracing::debug!("dropping query with QR bit set");
            return (Metrics::new(), None);
        }

        if query.header.rcode != Rcode::NoError {
            tracing::debug!(rcode = ?query.header.rcode, "rejecting query with non-zero rcode");
            let response = Message::make_format_error_response(query.header.id);
            return (Metrics::new(), Some(render(&response)));
        }

        if query.header.opcode != Opcode::Standard {
            tracing::debug!(opcode = ?query.header.opcode, "refusing non-standard opcode");
            let mut response = query.make_response();
            response.header.rcode = Rcode::NotImplemented;
            return (Metrics::new(), Some(render(&response)));
        }

        let tsig_key = match self.check_tsig(query, raw) {
            Ok(key) => key,
            Err(error) => {
                tracing::warn!(%error, "rejecting query");
                let response = Message::make_format_error_response(query.header.id);
                return (Metrics::new(), Some(render(&response)));
            }
        };

        let mut query_do_bit = false;
        let mut udp_payload_size = MINIMUM_UDP_PAYLOAD;
        let has_opt = query.additional.iter().any(|rr| is_opt(rr));
        for rr in &query.additional {
            if let RecordTypeWithData::OPT {
                udp_payload_size: size,
                do_bit,
                ..
            } = &rr.rtype_with_data
            {
                udp_payload_size = (*size).max(MINIMUM_UDP_PAYLOAD);
                query_do_bit = *do_bit;
            }
        }

        let size_cap = match transport {
            Transport::Udp => udp_payload_size as usize,
            Transport::Tcp => MAX_TCP_LENGTH,
        };

        if query.questions.len() == 1 && query.questions[0].qtype == QueryType::AXFR {
            let mut metrics = Metrics::new();
            if transport == Transport::Tcp {
                let bytes = self.handle_axfr(zones, &mut metrics, query);
                return (metrics, Some(bytes));
            }
            let mut response = query.make_response();
            response.header.rcode = Rcode::Refused;
            return (metrics, Some(render(&response)));
        }

        let mut response = query.make_response();
        let mut ctx = Context::new(zones, cache, CHASE_LIMIT);
        let mut any_resolved = false;

        for question in &query.questions {
            if question.is_unknown() {
                response.header.rcode = Rcode::Refused;
                continue;
            }
            any_resolved |= self.add_answer(
                &mut ctx,
                &mut response,
                &question.name,
                question.qtype,
                question.qclass,
                0,
            );
        }

        if !any_resolved && response.header.rcode == Rcode::NoError {
            response.header.rcode = Rcode::ServerFailure;
        }

        self.add_glue(&ctx, &mut response);

        if has_opt {
            response.additional.push(ResourceRecord {
                name: DomainName::root_domain(),
                rtype_with_data: RecordTypeWithData::OPT {
                    udp_payload_size: OUR_UDP_PAYLOAD,
                    extended_rcode: 0,
                    version: 0,
                    do_bit: query_do_bit,
                    options: Bytes::new(),
                },
                rclass: RecordClass::IN,
                ttl: 0,
            });
        }

        let mut exempt_len = 0usize;
        if let (Some(key), Some(signer)) = (tsig_key, self.signer) {
            let prelim = response.to_octets().unwrap_or_default();
            let mac = signer.generate(key, &prelim, None);
            response.additional.push(ResourceRecord {
                name: key.name.clone(),
                rtype_with_data: RecordTypeWithData::TSIG {
                    algorithm: key.algorithm.clone(),
                    time_signed: 0,
                    fudge: dns_types::protocol::tsig::DEFAULT_FUDGE_SECONDS,
                    mac,
                    original_id: query.header.id,
                    error: 0,
                    other: Bytes::new(),
                },
                rclass: RecordClass::from(255u16),
                ttl: 0,
            });
        }

        let exempt_count = usize::from(has_opt) + usize::from(tsig_key.is_some());
        if exempt_count > 0 {
            let mut probe = WritableBuffer::default();
            for rr in response.additional.iter().rev().take(exempt_count).rev() {
                let _ = rr.serialise(&mut probe);
            }
            exempt_len = probe.index();
        }
        let capped_len = size_cap.saturating_sub(exempt_len);

        let bytes = match response.to_octets_capped(capped_len, exempt_count) {
            Ok(Some(bytes)) => {
                if bytes.len() > 2 && bytes[2] & HEADER_MASK_TC != 0 {
                    ctx.metrics().truncated_response();
                }
                bytes
            }
            Ok(None) | Err(_) => render(&Message::make_format_error_response(query.header.id)),
        };

        (ctx.done(), Some(bytes))
    }

    /// Check the TSIG record on a query, if any.  `Ok(None)` means
    /// there was none; `Ok(Some(key))` means it verified; an error
    /// means the query should be rejected with FORMERR.
    fn check_tsig(
        &self,
        query: &Message,
        raw: &[u8],
    ) -> Result<Option<&'k TsigKey>, ResponderError> {
        let last = match query.additional.last() {
            Some(rr) => rr,
            None => return Ok(None),
        };
        let mac = match &last.rtype_with_data {
            RecordTypeWithData::TSIG { mac, .. } => mac,
            _ => return Ok(None),
        };

        let (keyring, signer) = match (self.keyring, self.signer) {
            (Some(k), Some(s)) => (k, s),
            _ => return Err(ResponderError::TsigVerificationFailed),
        };
        let key = keyring
            .key(&last.name)
            .ok_or(ResponderError::TsigVerificationFailed)?;
        signer
            .verify(key, raw, mac, None)
            .map_err(|_: TsigError| ResponderError::TsigVerificationFailed)?;
        Ok(Some(key))
    }

    fn handle_axfr(&self, zones: &Zones, metrics: &mut Metrics, query: &Message) -> BytesMut {
        let qname = &query.questions[0].name;
        if let Some(zone) = zones.get(qname) {
            if let Some(rrs) = zone.axfr() {
                let mut response = query.make_response();
                response.header.is_authoritative = true;
                response.answers = rrs;
                metrics.zone_answer(zone);
                return render(&response);
            }
        }
        let mut response = query.make_response();
        response.header.rcode = Rcode::Refused;
        render(&response)
    }

    /// Resolve one question, appending to `response`'s ANSWER and
    /// AUTHORITY sections, chasing CNAME/DNAME indirection up to the
    /// chase limit.
    ///
    /// Returns whether this question was resolved to a real outcome
    /// (an answer, a delegation, a name error, or any cache hit,
    /// negative or positive) as opposed to a plain cache miss with no
    /// matching zone either: the latter is the only case that should
    /// ever turn into SERVFAIL.
    fn add_answer(
        &self,
        ctx: &mut Context<'_>,
        response: &mut Message,
        qname: &DomainName,
        qtype: QueryType,
        qclass: QueryClass,
        depth: usize,
    ) -> bool {
        let question = Question {
            name: qname.clone(),
            qtype,
            qclass,
        };
        let _span = tracing::trace_span!("add_answer", %question, depth).entered();
        if depth >= CHASE_LIMIT || ctx.is_duplicate_question(&question) || ctx.at_chase_limit() {
            tracing::debug!("hit chase limit or loop, stopping here");
            return false;
        }
        ctx.push_question(&question);

        let resolved = if let Some((zone, result)) = ctx.zones.resolve(qname, qtype) {
            self.add_answer_from_zone(ctx, response, qname, qtype, qclass, depth, zone, result);
            true
        } else {
            self.add_answer_from_cache(ctx, response, qname, qtype, qclass, depth)
        };

        ctx.pop_question();
        resolved
    }

    fn add_answer_from_zone(
        &self,
        ctx: &mut Context<'_>,
        response: &mut Message,
        qname: &DomainName,
        qtype: QueryType,
        qclass: QueryClass,
        depth: usize,
        zone: &Zone,
        result: ZoneResult,
    ) {
        match result {
            ZoneResult::NameError => {
                ctx.metrics().zone_nameerror(zone);
                if let Some(soa) = zone.soa_rr() {
                    response.authority.push(soa);
                }
                if zone.is_authoritative() {
                    response.header.is_authoritative = true;
                    response.header.rcode = Rcode::NameError;
                }
            }
            ZoneResult::Delegation { ns_rrs } => {
                ctx.metrics().zone_delegation(zone);
                response.authority.extend(ns_rrs);
            }
            ZoneResult::Answer { rrs } => {
                ctx.metrics().zone_answer(zone);
                response.answers.extend(rrs);
                if zone.is_authoritative() {
                    response.header.is_authoritative = true;
                    if qtype != QueryType::Record(RecordType::NS) {
                        if let Some(ZoneResult::Answer { rrs: ns_rrs }) =
                            zone.resolve(zone.get_apex(), QueryType::Record(RecordType::NS))
                        {
                            response.authority.extend(ns_rrs);
                        }
                    }
                }
            }
            ZoneResult::CNAME { cname, rr } => {
                ctx.metrics().zone_cname(zone);
                response.answers.push(rr);
                self.add_answer(ctx, response, &cname, qtype, qclass, depth + 1);
            }
            ZoneResult::DName { dname, rr } => {
                ctx.metrics().zone_answer(zone);
                let owner = rr.name.clone();
                let ttl = rr.ttl;
                response.answers.push(rr);
                if let Some(synthesised) = qname.from_dname(&owner, &dname) {
                    let cname_rr = ResourceRecord {
                        name: qname.clone(),
                        rtype_with_data: RecordTypeWithData::CNAME {
                            cname: synthesised.clone(),
                        },
                        rclass: RecordClass::IN,
                        ttl,
                    };
                    response.answers.push(cname_rr);
                    self.add_answer(ctx, response, &synthesised, qtype, qclass, depth + 1);
                } else {
                    response.header.rcode = Rcode::YXDomain;
                }
            }
        }
    }

    /// Returns `false` only for `LookupResult::Unknown`: every other
    /// variant, including the negative-caching ones, is a genuine
    /// resolution of this question.
    fn add_answer_from_cache(
        &self,
        ctx: &mut Context<'_>,
        response: &mut Message,
        qname: &DomainName,
        qtype: QueryType,
        qclass: QueryClass,
        depth: usize,
    ) -> bool {
        match ctx.cache.lookup(qname, qtype, Credibility::Hint) {
            LookupResult::Unknown => {
                ctx.metrics().cache_miss();
                return false;
            }
            LookupResult::NxDomain => {
                ctx.metrics().cache_hit();
                ctx.metrics().nxdomain_response();
                response.header.rcode = Rcode::NameError;
            }
            LookupResult::NxRRset => {
                ctx.metrics().cache_hit();
            }
            LookupResult::Delegation(rrset) => {
                ctx.metrics().cache_hit();
                response.authority.extend(rrset.to_rrs());
            }
            LookupResult::Success(rrsets) => {
                ctx.metrics().cache_hit();
                for rrset in rrsets {
                    response.answers.extend(rrset.to_rrs());
                }
                if let LookupResult::Success(ns) =
                    ctx.cache.lookup(qname, QueryType::Record(RecordType::NS), Credibility::Hint)
                {
                    for rrset in ns {
                        response.authority.extend(rrset.to_rrs());
                    }
                }
            }
            LookupResult::CName(rrset) => {
                ctx.metrics().cache_hit();
                let cname = cname_target(&rrset);
                response.answers.extend(rrset.to_rrs());
                if let Some(cname) = cname {
                    self.add_answer(ctx, response, &cname, qtype, qclass, depth + 1);
                }
            }
            LookupResult::DName(rrset) => {
                ctx.metrics().cache_hit();
                let owner = rrset.owner.clone();
                let ttl = rrset.ttl;
                let target = dname_target(&rrset);
                response.answers.extend(rrset.to_rrs());
                if let Some(target) = target {
                    if let Some(synthesised) = qname.from_dname(&owner, &target) {
                        let cname_rr = ResourceRecord {
                            name: qname.clone(),
                            rtype_with_data: RecordTypeWithData::CNAME {
                                cname: synthesised.clone(),
                            },
                            rclass: RecordClass::IN,
                            ttl,
                        };
                        response.answers.push(cname_rr);
                        self.add_answer(ctx, response, &synthesised, qtype, qclass, depth + 1);
                    } else {
                        response.header.rcode = Rcode::YXDomain;
                    }
                }
            }
        }
        true
    }

    /// Resolve glue: for every NS/MX/SRV record already placed in
    /// ANSWER or AUTHORITY, look up its target's address records at
    /// `Credibility::Any` (zone first, then cache) and append them to
    /// ADDITIONAL.
    fn add_glue(&self, ctx: &Context<'_>, response: &mut Message) {
        let mut targets: Vec<DomainName> = Vec::new();
        for rr in response.answers.iter().chain(response.authority.iter()) {
            if let Some(name) = rr.rtype_with_data.additional_name() {
                if !targets.contains(name) {
                    targets.push(name.clone());
                }
            }
        }

        for target in targets {
            for rtype in [RecordType::A, RecordType::AAAA] {
                let qtype = QueryType::Record(rtype);
                if let Some((_, ZoneResult::Answer { rrs })) = ctx.zones.resolve(&target, qtype) {
                    response.additional.extend(rrs);
                    continue;
                }
                if let LookupResult::Success(rrsets) =
                    ctx.cache.lookup(&target, qtype, Credibility::Any)
                {
                    for rrset in rrsets {
                        response.additional.extend(rrset.to_rrs());
                    }
                }
            }
        }
    }
}

impl<'k, 's> Default for Responder<'k, 's> {
    fn default() -> Self {
        Self::new()
    }
}

fn is_opt(rr: &ResourceRecord) -> bool {
    matches!(rr.rtype_with_data, RecordTypeWithData::OPT { .. })
}

fn cname_target(rrset: &RRset) -> Option<DomainName> {
    match rrset.records.first() {
        Some(RecordTypeWithData::CNAME { cname }) => Some(cname.clone()),
        _ => None,
    }
}

fn dname_target(rrset: &RRset) -> Option<DomainName> {
    match rrset.records.first() {
        Some(RecordTypeWithData::DNAME { dname }) => Some(dname.clone()),
        _ => None,
    }
}

/// Render a message to wire format, falling back to a bare,
/// guaranteed-infallible header-only encoding if serialisation
/// somehow fails (it cannot, in practice, for the small messages this
/// fallback is ever used on).
fn render(message: &Message) -> BytesMut {
    match message.to_octets() {
        Ok(bytes) => bytes,
        Err(_) => {
            let mut buffer = WritableBuffer::default();
            message.header.serialise(&mut buffer);
            buffer.write_u16(0);
            buffer.write_u16(0);
            buffer.write_u16(0);
            buffer.write_u16(0);
            buffer.octets
        }
    }
}
