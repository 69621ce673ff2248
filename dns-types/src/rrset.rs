//! The `RRset` and `Credibility` types shared by the cache and the
//! zone store: a group of records under one (owner, type, class), and
//! the trust ranking used to decide which of two conflicting answers
//! wins.

use crate::protocol::types::{DomainName, RecordClass, RecordType, RecordTypeWithData, ResourceRecord};

/// Trust ranking for cached and zone data, lowest to highest.  See RFC
/// 2181 section 5.4.1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum Credibility {
    /// Root hints and other bootstrap data.
    Hint,
    /// Data received in answer to an `ANY` query, or otherwise
    /// unattributed.
    Any,
    /// Additional-section data (glue).
    Glue,
    /// Answer or authority data from a non-authoritative response.
    Normal,
    /// Answer or authority data from an authoritative response (the
    /// `AA` bit was set).
    Auth,
    /// Data served directly out of a locally-configured zone.
    Zone,
}

/// A nonempty set of records sharing (owner, rrset-type, class).
///
/// The TTL of the set is the minimum TTL of its members at insertion
/// time; later members do not lower it further (RFC 2181 section
/// 5.2), matching how `add_record` and `merge` are defined on `Cache`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RRset {
    pub owner: DomainName,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub records: Vec<RecordTypeWithData>,
    /// RRSIGs covering this type, kept out of `records` so it never
    /// becomes ambiguous whether a given element is data or a
    /// signature over that data.
    pub rrsigs: Vec<ResourceRecord>,
}

impl RRset {
    /// Build a singleton `RRset` from one resource record.
    pub fn singleton(rr: &ResourceRecord) -> Self {
        Self {
            owner: rr.name.clone(),
            rtype: rr.rtype_with_data.rtype(),
            rclass: rr.rclass,
            ttl: rr.ttl,
            records: vec![rr.rtype_with_data.clone()],
            rrsigs: Vec::new(),
        }
    }

    /// Group a slice of same-(owner,type,class) records into one
    /// `RRset`, taking the minimum TTL.  Returns `None` if the input
    /// is empty or the records do not in fact share owner/type/class.
    pub fn from_records(rrs: &[ResourceRecord]) -> Option<Self> {
        let first = rrs.first()?;
        let owner = first.name.clone();
        let rtype = first.rtype_with_data.rtype();
        let rclass = first.rclass;

        let mut ttl = first.ttl;
        let mut records = Vec::with_capacity(rrs.len());
        for rr in rrs {
            if rr.name != owner || rr.rtype_with_data.rtype() != rtype || rr.rclass != rclass {
                return None;
            }
            ttl = ttl.min(rr.ttl);
            records.push(rr.rtype_with_data.clone());
        }

        Some(Self {
            owner,
            rtype,
            rclass,
            ttl,
            records,
            rrsigs: Vec::new(),
        })
    }

    /// Merge records from `other` into `self` that are not already
    /// present, per the cache's same-credibility merge rule.  Does not
    /// touch the TTL -- see DESIGN.md for the merge-TTL open question.
    pub fn merge_in(&mut self, other: &RRset) {
        for rec in &other.records {
            if !self.records.contains(rec) {
                self.records.push(rec.clone());
            }
        }
    }

    pub fn to_rrs(&self) -> Vec<ResourceRecord> {
        self.records
            .iter()
            .map(|rtype_with_data| ResourceRecord {
                name: self.owner.clone(),
                rtype_with_data: rtype_with_data.clone(),
                rclass: self.rclass,
                ttl: self.ttl,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    #[test]
    fn credibility_total_order() {
        assert!(Credibility::Hint < Credibility::Any);
        assert!(Credibility::Any < Credibility::Glue);
        assert!(Credibility::Glue < Credibility::Normal);
        assert!(Credibility::Normal < Credibility::Auth);
        assert!(Credibility::Auth < Credibility::Zone);
    }

    #[test]
    fn from_records_takes_min_ttl() {
        let mut a = a_record("x.example.", Ipv4Addr::new(1, 1, 1, 1));
        a.ttl = 300;
        let mut b = a_record("x.example.", Ipv4Addr::new(2, 2, 2, 2));
        b.ttl = 100;

        let rrset = RRset::from_records(&[a, b]).unwrap();
        assert_eq!(100, rrset.ttl);
        assert_eq!(2, rrset.records.len());
    }

    #[test]
    fn from_records_rejects_mismatched_owner() {
        let a = a_record("x.example.", Ipv4Addr::new(1, 1, 1, 1));
        let b = a_record("y.example.", Ipv4Addr::new(2, 2, 2, 2));
        assert!(RRset::from_records(&[a, b]).is_none());
    }
}
