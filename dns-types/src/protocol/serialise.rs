//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};

use crate::protocol::types::*;
use crate::protocol::wire::CompressionTable;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Message {
    /// Encode the message into at most `max_length` octets, truncating
    /// whole RRsets from the end of ANSWER or AUTHORITY and setting TC
    /// if it doesn't fit; dropping ADDITIONAL records never sets TC.
    /// The last `exempt_additional` records of the ADDITIONAL section
    /// (OPT, then TSIG, in that order, when present) are always
    /// written in full regardless of the cap -- the caller is expected
    /// to have already shrunk `max_length` by their rendered size.
    ///
    /// Returns `None` if `max_length` is too small to hold even the
    /// fixed 12-octet header.
    ///
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn to_octets_capped(
        &self,
        max_length: usize,
        exempt_additional: usize,
    ) -> Result<Option<BytesMut>, Error> {
        let mut buffer = WritableBuffer::default();
        if self.serialise_capped(&mut buffer, max_length, exempt_additional)? {
            Ok(Some(buffer.octets))
        } else {
            Ok(None)
        }
    }

    /// As `to_octets_capped`, but serialising into a caller-supplied
    /// buffer.  Returns `false` (leaving `buffer` unchanged) if
    /// `max_length` doesn't fit the fixed header.
    ///
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise_capped(
        &self,
        buffer: &mut WritableBuffer,
        max_length: usize,
        exempt_additional: usize,
    ) -> Result<bool, Error> {
        const HEADER_LEN: usize = 12;
        if max_length < HEADER_LEN {
            return Ok(false);
        }

        let start = buffer.index();
        let qdcount = usize_to_u16(self.questions.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        let ancount_index = buffer.index();
        buffer.write_u16(0);
        let nscount_index = buffer.index();
        buffer.write_u16(0);
        let arcount_index = buffer.index();
        buffer.write_u16(0);

        for question in &self.questions {
            question.serialise(buffer);
        }

        let split = self.additional.len().saturating_sub(exempt_additional);
        let (ordinary_additional, exempt_rrs) = self.additional.split_at(split);

        let (ancount, an_truncated) = serialise_capped_section(buffer, &self.answers, max_length)?;
        let (nscount, ns_truncated) = if an_truncated {
            (0, true)
        } else {
            serialise_capped_section(buffer, &self.authority, max_length)?
        };
        let (ordinary_arcount, _) = if an_truncated || ns_truncated {
            (0, true)
        } else {
            serialise_capped_section(buffer, ordinary_additional, max_length)?
        };

        let mut arcount = usize::from(ordinary_arcount);
        for rr in exempt_rrs {
            rr.serialise(buffer)?;
            arcount += 1;
        }
        let arcount = usize_to_u16(arcount)?;

        if an_truncated || ns_truncated {
            buffer.octets[start + 2] |= HEADER_MASK_TC;
        }

        patch_u16(buffer, ancount_index, ancount);
        patch_u16(buffer, nscount_index, nscount);
        patch_u16(buffer, arcount_index, arcount);

        Ok(true)
    }
}

/// Serialise as many whole RRsets (consecutive records sharing owner
/// and type) from `rrs` as fit in `max_length`, starting at the
/// buffer's current position.  Returns the number of records written
/// and whether any had to be dropped.
fn serialise_capped_section(
    buffer: &mut WritableBuffer,
    rrs: &[ResourceRecord],
    max_length: usize,
) -> Result<(u16, bool), Error> {
    let mut count: u16 = 0;
    let mut boundary_index = buffer.index();
    let mut boundary_count = 0u16;
    let mut prev_key: Option<(DomainName, RecordType)> = None;

    for rr in rrs {
        let key = (rr.name.clone(), rr.rtype_with_data.rtype());
        if prev_key.as_ref() != Some(&key) {
            boundary_index = buffer.index();
            boundary_count = count;
            prev_key = Some(key);
        }

        rr.serialise(buffer)?;
        count += 1;

        if buffer.index() > max_length {
            buffer.octets.truncate(boundary_index);
            return Ok((boundary_count, true));
        }
    }

    Ok((count, false))
}

/// Patch a previously-reserved two-octet field (à la RDLENGTH) now
/// that its real value is known.
fn patch_u16(buffer: &mut WritableBuffer, index: usize, value: u16) {
    let [hi, lo] = value.to_be_bytes();
    buffer.octets[index] = hi;
    buffer.octets[index + 1] = lo;
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true);
        self.rtype_with_data.rtype().serialise(buffer);

        if let RecordTypeWithData::OPT {
            udp_payload_size,
            extended_rcode,
            version,
            do_bit,
            ..
        } = &self.rtype_with_data
        {
            buffer.write_u16(*udp_payload_size);
            let do_flag: u32 = if *do_bit { 0b1000_0000_0000_0000 } else { 0 };
            let ttl = (u32::from(*extended_rcode) << 24) | (u32::from(*version) << 16) | do_flag;
            buffer.write_u32(ttl);
        } else {
            self.rclass.serialise(buffer);
            buffer.write_u32(self.ttl);
        }

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer, false),
            RecordTypeWithData::MD { madname } => madname.serialise(buffer, false),
            RecordTypeWithData::MF { madname } => madname.serialise(buffer, false),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer, false),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false);
                rname.serialise(buffer, false);
                buffer.write_u32(*serial);
                buffer.write_u32(*refresh);
                buffer.write_u32(*retry);
                buffer.write_u32(*expire);
                buffer.write_u32(*minimum);
            }
            RecordTypeWithData::MB { madname } => madname.serialise(buffer, false),
            RecordTypeWithData::MG { mdmname } => mdmname.serialise(buffer, false),
            RecordTypeWithData::MR { newname } => newname.serialise(buffer, false),
            RecordTypeWithData::NULL { octets } => buffer.write_octets(octets),
            RecordTypeWithData::WKS { octets } => buffer.write_octets(octets),
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer, false),
            RecordTypeWithData::HINFO { octets } => buffer.write_octets(octets),
            RecordTypeWithData::MINFO { rmailbx, emailbx } => {
                rmailbx.serialise(buffer, false);
                emailbx.serialise(buffer, false);
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, false);
            }
            RecordTypeWithData::TXT { octets } => buffer.write_octets(octets),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, false);
            }
            RecordTypeWithData::DNAME { dname } => dname.serialise(buffer, false),
            RecordTypeWithData::OPT { options, .. } => buffer.write_octets(options),
            RecordTypeWithData::TSIG {
                algorithm,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other,
            } => {
                algorithm.serialise(buffer, false);
                buffer.write_octets(&time_signed.to_be_bytes()[2..]);
                buffer.write_u16(*fudge);
                buffer.write_u16(usize_to_u16(mac.len())?);
                buffer.write_octets(mac);
                buffer.write_u16(*original_id);
                buffer.write_u16(*error);
                buffer.write_u16(usize_to_u16(other.len())?);
                buffer.write_octets(other);
            }
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        if compress {
            if let Some(ptr) = buffer.name_pointer(self) {
                buffer.write_u16(ptr);
                return;
            }
        }

        buffer.memoise_name(self);
        for label in &self.labels {
            buffer.write_u8(label.len());
            buffer.write_octets(&label.octets);
        }
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    compression: CompressionTable,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            compression: CompressionTable::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn memoise_name(&mut self, name: &DomainName) {
        if !name.is_root() && self.compression.get(name).is_none() {
            self.compression.add(self.index(), name);
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.compression
            .get(name)
            .map(|offset| offset | 0b1100_0000_0000_0000)
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_in() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("www.example.com.").serialise(&mut buf, true);
        domain("www.example.com.").serialise(&mut buf, true);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                0b1100_0000, 0b0000_0100 // pointer
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_out() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("www.example.com.").serialise(&mut buf, true);
        domain("www.example.com.").serialise(&mut buf, false);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_records() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        Question {
            name: domain("www.example.com."),
            qtype: QueryType::Wildcard,
            qclass: QueryClass::Wildcard,
        }.serialise(&mut buf);

        let _ = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }.serialise(&mut buf);

        let _ = ResourceRecord {
            name: domain("mx.example.com."),
            rtype_with_data: RecordTypeWithData::CNAME {
                cname: domain("www.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }.serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // QNAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // QTYPE
                0, 255,
                // QCLASS
                0, 255,
                // NAME
                0b1100_0000, 0b0000_0100, // pointer to "www.example.com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0010, // 18 octets
                // RDATA
                0, 32, // preference
                2, 109, 120, // "mx"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // NAME
                0b1100_0000, 0b0010_0111, // pointer to "mx.example.com"
                // TYPE
                0b0000_0000, 0b0000_0101, // CNAME
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0001, // 17 octets
                // RDATA
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let _ = rr.serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0010, // 18 octets
                // RDATA
                0, 32, // preference
                2, 109, 120, // "mx"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    fn capped_test_message(num_answers: usize) -> Message {
        let mut answers = Vec::with_capacity(num_answers);
        for i in 0..num_answers {
            answers.push(ResourceRecord {
                name: domain(&format!("rr{i}.example.")),
                rtype_with_data: RecordTypeWithData::A {
                    address: std::net::Ipv4Addr::new(10, 0, 0, i as u8),
                },
                rclass: RecordClass::IN,
                ttl: 300,
            });
        }
        Message {
            header: Header {
                id: 1,
                is_response: true,
                opcode: Opcode::Standard,
                is_authoritative: true,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("example."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers,
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    #[test]
    fn capped_encode_fails_below_header_size() {
        let msg = capped_test_message(1);
        assert_eq!(None, msg.to_octets_capped(11, 0).unwrap());
    }

    #[test]
    fn capped_encode_fits_everything_under_a_generous_cap() {
        let msg = capped_test_message(5);
        let full = msg.to_octets().unwrap();
        let capped = msg.to_octets_capped(full.len(), 0).unwrap().unwrap();
        assert_eq!(full, capped);
    }

    #[test]
    fn capped_encode_drops_whole_rrsets_and_sets_tc() {
        let msg = capped_test_message(5);
        let full = msg.to_octets().unwrap();

        // big enough for the header, question, and a couple of answers,
        // but not all five
        let capped = msg
            .to_octets_capped(full.len() - 40, 0)
            .unwrap()
            .expect("cap fits the header");

        assert!(capped.len() < full.len());
        assert_eq!(HEADER_MASK_TC, capped[2] & HEADER_MASK_TC);

        let decoded = Message::from_octets(&capped).unwrap();
        assert!(decoded.answers.len() < 5);
        assert!(decoded.header.is_truncated);
    }

    #[test]
    fn capped_encode_exempts_trailing_additional_records() {
        let mut msg = capped_test_message(1);
        let opt = ResourceRecord {
            name: domain("."),
            rtype_with_data: RecordTypeWithData::OPT {
                udp_payload_size: 4096,
                extended_rcode: 0,
                version: 0,
                do_bit: false,
                options: bytes::Bytes::new(),
            },
            rclass: RecordClass::IN,
            ttl: 0,
        };
        msg.additional.push(opt);

        let capped = msg.to_octets_capped(12 + 5 + 11, 1).unwrap().unwrap();
        let decoded = Message::from_octets(&capped).unwrap();
        assert_eq!(1, decoded.additional.len());
        assert_eq!(RecordType::OPT, decoded.additional[0].rtype_with_data.rtype());
    }
}
