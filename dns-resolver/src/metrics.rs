//! Per-request metrics.  A `Responder` builds one of these per query
//! and hands it to `Context::done`, rather than touching a Prometheus
//! registry directly -- the binary crate's `resolved::metrics` is
//! responsible for folding these into its counters.

use dns_types::protocol::types::*;
use dns_types::zones::types::Zone;

/// Metrics from a single query/response cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    /// Answers served straight out of an authoritative zone: exact
    /// answers, CNAMEs, delegations, and name errors.
    pub authoritative_hits: u64,
    /// Answers served out of a non-authoritative (override) zone.
    pub nonauthoritative_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Responses for which the RCODE was NXDOMAIN.
    pub nxdomain: u64,
    /// Responses which had to be truncated to fit the length cap.
    pub truncated: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zone_answer(&mut self, zone: &Zone) {
        if zone.is_authoritative() {
            self.authoritative_hits += 1;
        } else {
            self.nonauthoritative_hits += 1;
        }
    }

    pub fn zone_cname(&mut self, zone: &Zone) {
        self.zone_answer(zone);
    }

    pub fn zone_delegation(&mut self, zone: &Zone) {
        if zone.is_authoritative() {
            self.authoritative_hits += 1;
        }
    }

    pub fn zone_nameerror(&mut self, zone: &Zone) {
        if zone.is_authoritative() {
            self.authoritative_hits += 1;
        }
        self.nxdomain += 1;
    }

    pub fn cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn cache_miss(&mut self) {
        self.cache_misses += 1;
    }

    pub fn nxdomain_response(&mut self) {
        self.nxdomain += 1;
    }

    pub fn truncated_response(&mut self) {
        self.truncated += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::domain;
    use dns_types::zones::types::Zone;

    #[test]
    fn authoritative_zone_answer_counts_as_authoritative() {
        let mut metrics = Metrics::new();
        let zone = Zone::new(domain("example."), Some(dummy_soa()));
        metrics.zone_answer(&zone);
        assert_eq!(1, metrics.authoritative_hits);
        assert_eq!(0, metrics.nonauthoritative_hits);
    }

    #[test]
    fn nonauthoritative_zone_answer_counts_as_override() {
        let mut metrics = Metrics::new();
        let zone = Zone::new(domain("example."), None);
        metrics.zone_answer(&zone);
        assert_eq!(0, metrics.authoritative_hits);
        assert_eq!(1, metrics.nonauthoritative_hits);
    }

    fn dummy_soa() -> dns_types::zones::types::SOA {
        dns_types::zones::types::SOA {
            mname: domain("ns1.example."),
            rname: domain("hostmaster.example."),
            serial: 1,
            refresh: 3600,
            retry: 600,
            expire: 86400,
            minimum: 60,
        }
    }
}
