//! Decoding a `Message` from wire-format octets.
//!
//! Mirrors `serialise.rs` section for section: header, then the four
//! record sections in order, following compression pointers backwards
//! through a `ConsumableBuffer` clone so the main cursor is untouched.

use bytes::Bytes;

use crate::protocol::types::{
    DomainName, Header, Label, Message, Opcode, QueryClass, QueryType, Question, Rcode,
    RecordClass, RecordType, RecordTypeWithData, ResourceRecord,
};
use crate::protocol::wire::{ConsumableBuffer, Error, MAXLABELS};

impl Message {
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        let mut buffer = ConsumableBuffer::new(octets);
        Self::deserialise(&mut buffer)
    }

    fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let (header, qdcount, ancount, nscount, arcount) = deserialise_header(buffer)?;

        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            questions.push(deserialise_question(buffer, header.id)?);
        }

        let mut answers = Vec::with_capacity(ancount as usize);
        for _ in 0..ancount {
            answers.push(deserialise_rr(buffer, header.id)?);
        }

        let mut authority = Vec::with_capacity(nscount as usize);
        for _ in 0..nscount {
            authority.push(deserialise_rr(buffer, header.id)?);
        }

        let mut additional = Vec::with_capacity(arcount as usize);
        for _ in 0..arcount {
            additional.push(deserialise_rr(buffer, header.id)?);
        }

        Ok(Message {
            header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

fn deserialise_header(buffer: &mut ConsumableBuffer) -> Result<(Header, u16, u16, u16, u16), Error> {
    let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
    let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
    let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
    let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
    let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
    let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
    let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

    let header = Header {
        id,
        is_response: flags1 & 0b1000_0000 != 0,
        opcode: Opcode::from((flags1 & 0b0111_1000) >> 3),
        is_authoritative: flags1 & 0b0000_0100 != 0,
        is_truncated: flags1 & 0b0000_0010 != 0,
        recursion_desired: flags1 & 0b0000_0001 != 0,
        recursion_available: flags2 & 0b1000_0000 != 0,
        rcode: Rcode::from(flags2 & 0b0000_1111),
    };

    Ok((header, qdcount, ancount, nscount, arcount))
}

fn deserialise_question(buffer: &mut ConsumableBuffer, id: u16) -> Result<Question, Error> {
    let name = deserialise_domain_name(buffer, id)?;
    let qtype = QueryType::from(buffer.next_u16().ok_or(Error::QuestionTooShort(id))?);
    let qclass = QueryClass::from(buffer.next_u16().ok_or(Error::QuestionTooShort(id))?);
    Ok(Question { name, qtype, qclass })
}

fn deserialise_rr(buffer: &mut ConsumableBuffer, id: u16) -> Result<ResourceRecord, Error> {
    let name = deserialise_domain_name(buffer, id)?;
    let rtype = RecordType::from(buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?);
    let rclass_raw = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
    let ttl_raw = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
    let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

    let rdata_start = buffer.position();
    let rtype_with_data = deserialise_rdata(buffer, id, rtype, rdlength, rclass_raw, ttl_raw)?;
    let rdata_stop = buffer.position();

    if rdata_stop != rdata_start + rdlength as usize {
        return Err(Error::ResourceRecordInvalid(id));
    }

    // OPT repurposes CLASS/TTL for payload size and extended RCODE,
    // both already captured inside `rtype_with_data`; the envelope
    // fields are meaningless for it, so a fixed placeholder is used.
    let (rclass, ttl) = if matches!(rtype_with_data, RecordTypeWithData::OPT { .. }) {
        (RecordClass::IN, 0)
    } else {
        (RecordClass::from(rclass_raw), ttl_raw)
    };

    Ok(ResourceRecord {
        name,
        rtype_with_data,
        rclass,
        ttl,
    })
}

#[allow(clippy::too_many_arguments)]
fn deserialise_rdata(
    buffer: &mut ConsumableBuffer,
    id: u16,
    rtype: RecordType,
    rdlength: u16,
    rclass_raw: u16,
    ttl_raw: u32,
) -> Result<RecordTypeWithData, Error> {
    let rdlength = rdlength as usize;

    match rtype {
        RecordType::A => {
            let octets = buffer.take(4).ok_or(Error::ResourceRecordTooShort(id))?;
            Ok(RecordTypeWithData::A {
                address: std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
            })
        }
        RecordType::NS => Ok(RecordTypeWithData::NS {
            nsdname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::MD => Ok(RecordTypeWithData::MD {
            madname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::MF => Ok(RecordTypeWithData::MF {
            madname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::CNAME => Ok(RecordTypeWithData::CNAME {
            cname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::SOA => {
            let mname = deserialise_domain_name(buffer, id)?;
            let rname = deserialise_domain_name(buffer, id)?;
            let serial = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
            let refresh = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
            let retry = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
            let expire = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
            let minimum = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
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
        RecordType::MB => Ok(RecordTypeWithData::MB {
            madname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::MG => Ok(RecordTypeWithData::MG {
            mdmname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::MR => Ok(RecordTypeWithData::MR {
            newname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::NULL => Ok(RecordTypeWithData::NULL {
            octets: take_bytes(buffer, rdlength, id)?,
        }),
        RecordType::WKS => Ok(RecordTypeWithData::WKS {
            octets: take_bytes(buffer, rdlength, id)?,
        }),
        RecordType::PTR => Ok(RecordTypeWithData::PTR {
            ptrdname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::HINFO => Ok(RecordTypeWithData::HINFO {
            octets: take_bytes(buffer, rdlength, id)?,
        }),
        RecordType::MINFO => {
            let rmailbx = deserialise_domain_name(buffer, id)?;
            let emailbx = deserialise_domain_name(buffer, id)?;
            Ok(RecordTypeWithData::MINFO { rmailbx, emailbx })
        }
        RecordType::MX => {
            let preference = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
            let exchange = deserialise_domain_name(buffer, id)?;
            Ok(RecordTypeWithData::MX {
                preference,
                exchange,
            })
        }
        RecordType::TXT => Ok(RecordTypeWithData::TXT {
            octets: take_bytes(buffer, rdlength, id)?,
        }),
        RecordType::AAAA => {
            let octets = buffer.take(16).ok_or(Error::ResourceRecordTooShort(id))?;
            let mut segments = [0u8; 16];
            segments.copy_from_slice(octets);
            Ok(RecordTypeWithData::AAAA {
                address: std::net::Ipv6Addr::from(segments),
            })
        }
        RecordType::SRV => {
            let priority = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
            let weight = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
            let port = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
            let target = deserialise_domain_name(buffer, id)?;
            Ok(RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            })
        }
        RecordType::DNAME => Ok(RecordTypeWithData::DNAME {
            dname: deserialise_domain_name(buffer, id)?,
        }),
        RecordType::OPT => {
            let extended_rcode = ((ttl_raw >> 24) & 0xFF) as u8;
            let version = ((ttl_raw >> 16) & 0xFF) as u8;
            let do_bit = (ttl_raw >> 15) & 0b1 != 0;
            Ok(RecordTypeWithData::OPT {
                udp_payload_size: rclass_raw,
                extended_rcode,
                version,
                do_bit,
                options: take_bytes(buffer, rdlength, id)?,
            })
        }
        RecordType::TSIG => {
            let algorithm = deserialise_domain_name(buffer, id)?;
            let time_signed = buffer.next_u48().ok_or(Error::ResourceRecordTooShort(id))?;
            let fudge = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
            let mac_size = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))? as usize;
            let mac = take_bytes(buffer, mac_size, id)?;
            let original_id = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
            let error = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
            let other_len = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))? as usize;
            let other = take_bytes(buffer, other_len, id)?;
            Ok(RecordTypeWithData::TSIG {
                algorithm,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other,
            })
        }
        RecordType::Unknown(tag) => Ok(RecordTypeWithData::Unknown {
            tag,
            octets: take_bytes(buffer, rdlength, id)?,
        }),
    }
}

fn take_bytes(buffer: &mut ConsumableBuffer, len: usize, id: u16) -> Result<Bytes, Error> {
    let octets = buffer.take(len).ok_or(Error::ResourceRecordTooShort(id))?;
    Ok(Bytes::copy_from_slice(octets))
}

/// Decode a domain name, following at most one level of indirection
/// per pointer (pointers may chain, but each must strictly precede
/// the position it was read from, which rules out loops).
fn deserialise_domain_name(buffer: &mut ConsumableBuffer, id: u16) -> Result<DomainName, Error> {
    let mut labels = Vec::new();
    let mut current = *buffer;
    let mut jumped_from: Option<usize> = None;

    loop {
        let label_start = current.position();
        let size = current.next_u8().ok_or(Error::NameTooShort(id))?;

        match size & 0b1100_0000 {
            0b0000_0000 => {
                if size == 0 {
                    labels.push(Label::new());
                    break;
                }

                if labels.len() >= MAXLABELS {
                    return Err(Error::TooManyLabels(id));
                }

                let octets = current.take(size as usize).ok_or(Error::NameTooShort(id))?;
                let label = Label::try_from(octets).map_err(|_| Error::NameTooLong(id))?;
                labels.push(label);
            }
            0b1100_0000 => {
                let lo = current.next_u8().ok_or(Error::NameTooShort(id))?;
                let target = (((size & 0b0011_1111) as usize) << 8) | lo as usize;

                if target >= label_start {
                    return Err(Error::BadCompression(id));
                }

                if jumped_from.is_none() {
                    jumped_from = Some(current.position());
                }
                current = current.at_offset(target);
            }
            _ => return Err(Error::BadLabelType(id)),
        }
    }

    if let Some(resume_at) = jumped_from {
        *buffer = buffer.at_offset(resume_at);
    } else {
        *buffer = current;
    }

    DomainName::from_labels(labels).ok_or(Error::NameTooLong(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    fn question(name: &str, qtype: QueryType) -> Question {
        Question {
            name: domain(name),
            qtype,
            qclass: QueryClass::Record(RecordClass::IN),
        }
    }

    #[test]
    fn roundtrip_simple_query() {
        let message = Message::from_question(42, question("www.example.com.", QueryType::Record(RecordType::A)));
        let bytes = message.clone().to_octets().unwrap();
        let decoded = Message::from_octets(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn roundtrip_response_with_compression() {
        let mut message = Message::from_question(7, question("a.example.com.", QueryType::Record(RecordType::A)));
        message.header.is_response = true;
        message.answers = vec![a_record("a.example.com.", Ipv4Addr::new(1, 2, 3, 4))];
        message.authority = vec![ns_record("example.com.", "ns1.example.com.")];
        message.additional = vec![a_record("ns1.example.com.", Ipv4Addr::new(5, 6, 7, 8))];

        let bytes = message.clone().to_octets().unwrap();
        let decoded = Message::from_octets(&bytes).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn rejects_self_referential_pointer() {
        // header (12 bytes, all zero except qdcount=1) followed by a
        // name whose only label is a pointer to its own offset (12),
        // which can never strictly precede its own start.
        let mut octets = vec![0u8; 12];
        octets[4..6].copy_from_slice(&1u16.to_be_bytes()); // qdcount = 1
        octets.push(0b1100_0000);
        octets.push(12);
        octets.extend_from_slice(&1u16.to_be_bytes()); // qtype
        octets.extend_from_slice(&1u16.to_be_bytes()); // qclass

        assert_eq!(Message::from_octets(&octets), Err(Error::BadCompression(0)));
    }

    #[test]
    fn dname_roundtrip() {
        let mut message = Message::from_question(1, question("a.example.com.", QueryType::Record(RecordType::A)));
        message.header.is_response = true;
        message.answers = vec![dname_record("example.com.", "example.net.")];

        let bytes = message.clone().to_octets().unwrap();
        let decoded = Message::from_octets(&bytes).unwrap();
        assert_eq!(message, decoded);
    }
}
