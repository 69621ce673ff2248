//! Credibility-aware cache of resource-record sets.
//!
//! One `CacheEntry` is kept per `(owner, type)` pair (RFC 2181 section
//! 5.4.1's single-RRset-wins model), tagged with the `Credibility` it
//! was learned at and an absolute expiry time.  Storage and eviction
//! reuse the teacher's `PartitionedCache`: records are grouped into
//! per-owner partitions so that a whole name can be pruned in LRU
//! order in one go, with a separate priority queue tracking the
//! soonest-to-expire partition.

use priority_queue::PriorityQueue;
use std::cmp::Eq;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dns_types::protocol::types::*;
use dns_types::rrset::{Credibility, RRset};

/// The outcome of a `Cache::lookup`, mirroring the one a zone lookup
/// produces so a responder can treat the two uniformly.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult {
    /// Nothing usable found; the caller should consult the zone store
    /// or recurse.
    Unknown,
    /// A cached NXDOMAIN: the name itself does not exist.
    NxDomain,
    /// The name exists but has no RRset of the queried type.
    NxRRset,
    /// A referral: the queried name is below a delegated subzone.
    Delegation(RRset),
    /// The owner has a `CNAME`; the caller should chase it.
    CName(RRset),
    /// The owner is a strict subdomain of a `DNAME`; the caller should
    /// synthesise a `CNAME` from it.
    DName(RRset),
    /// One or more RRsets at the exact queried name.
    Success(Vec<RRset>),
}

/// A convenience wrapper around a `Cache` which lets it be shared
/// between threads.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

impl SharedCache {
    /// Make a new, empty, shared cache.
    pub fn new() -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(Cache::new())),
        }
    }

    /// Create a new cache with the given desired size.
    pub fn with_desired_size(desired_size: usize) -> Self {
        SharedCache {
            cache: Arc::new(Mutex::new(Cache::with_desired_size(desired_size))),
        }
    }

    /// Look up a name and type, at or above the given minimum
    /// credibility.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn lookup(&self, qname: &DomainName, qtype: QueryType, min_cred: Credibility) -> LookupResult {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .lookup(qname, qtype, min_cred)
    }

    /// Insert an RRset at the given credibility.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn add_rrset(&self, rrset: RRset, cred: Credibility) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .add_rrset(rrset, cred);
    }

    /// Insert a single record at the given credibility.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn add_record(&self, record: &ResourceRecord, cred: Credibility) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .add_record(record, cred);
    }

    /// Record that `name` (if `rtype` is `None`) or `(name, rtype)`
    /// does not exist, with a TTL derived from the authority-section
    /// `SOA`.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn add_negative(
        &self,
        name: &DomainName,
        rtype: Option<RecordType>,
        soa: Option<&ResourceRecord>,
        cred: Credibility,
    ) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .add_negative(name, rtype, soa, cred);
    }

    /// Ingest every answer in a response message, following any
    /// in-message `CNAME`/`DNAME` chain and admitting `ADDITIONAL`
    /// records only where a prior record called for glue.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn add_message(&self, msg: &Message) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).add_message(msg);
    }

    /// Remove every RRset at `(name, rtype)`.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn flush_set(&self, name: &DomainName, rtype: RecordType) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .flush_set(name, rtype);
    }

    /// Remove every entry for `name`, of any type.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn flush_name(&self, name: &DomainName) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).flush_name(name);
    }

    /// Atomically clears expired entries and, if the cache has grown
    /// beyond its desired size, prunes entries to get down to size.
    ///
    /// Returns `(has overflowed?, current size, num expired, num pruned)`.
    ///
    /// # Panics
    ///
    /// If the mutex has been poisoned.
    pub fn prune(&self) -> (bool, usize, usize, usize) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).prune()
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The key a cache entry is stored under, within a name's partition.
///
/// `NxDomain` is kept separate from any particular `RecordType` so
/// that "this name doesn't exist at all" and "this name exists but
/// has no RRset of this type" can coexist without clobbering each
/// other, matching the two negative-entry shapes in the data model.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum CacheKey {
    Type(RecordType),
    NxDomain,
}

/// What is stored for a given `(name, CacheKey)`.
#[derive(Debug, Clone, PartialEq)]
enum CacheEntry {
    Positive { rrset: RRset, cred: Credibility },
    Negative { cred: Credibility },
}

impl CacheEntry {
    fn cred(&self) -> Credibility {
        match self {
            CacheEntry::Positive { cred, .. } => *cred,
            CacheEntry::Negative { cred } => *cred,
        }
    }
}

/// Caching for RRsets, with credibility-aware replacement and
/// negative caching.
///
/// You probably want to use `SharedCache` instead.
#[derive(Debug, Clone)]
pub struct Cache {
    inner: PartitionedCache<DomainName, CacheKey, CacheEntry>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    /// Create a new cache with a default desired size.
    pub fn new() -> Self {
        Self {
            inner: PartitionedCache::new(),
        }
    }

    /// Create a new cache with the given desired size.
    ///
    /// The `prune` method will remove expired entries, and also enough entries
    /// (in least-recently-used order) to get down to this size.
    pub fn with_desired_size(desired_size: usize) -> Self {
        Self {
            inner: PartitionedCache::with_desired_size(desired_size),
        }
    }

    /// Insert an RRset, applying the credibility-replacement rules: a
    /// strictly more credible existing entry wins outright; an
    /// equally credible positive entry is merged into; anything else
    /// is replaced.  A zero TTL deletes the entry instead, unless a
    /// strictly more credible entry is already there.
    pub fn add_rrset(&mut self, rrset: RRset, cred: Credibility) {
        let key = CacheKey::Type(rrset.rtype);
        let existing_cred = self
            .inner
            .get(&rrset.owner, &key)
            .map(|(entry, _)| entry.cred());

        if rrset.ttl == 0 {
            if existing_cred.map_or(true, |ec| ec <= cred) {
                self.inner.remove(&rrset.owner, &key);
            }
            return;
        }

        if let Some(ec) = existing_cred {
            if ec > cred {
                return;
            }
        }

        let merged = if existing_cred == Some(cred) {
            match self.inner.get(&rrset.owner, &key) {
                Some((CacheEntry::Positive { rrset: existing, .. }, _)) => {
                    let mut merged = existing.clone();
                    merged.merge_in(&rrset);
                    merged
                }
                _ => rrset.clone(),
            }
        } else {
            rrset.clone()
        };

        let ttl = Duration::from_secs(merged.ttl.into());
        self.inner.upsert(
            rrset.owner,
            key,
            CacheEntry::Positive { rrset: merged, cred },
            ttl,
        );
    }

    /// Insert a single record, merging it into any existing
    /// same-credibility RRset.
    pub fn add_record(&mut self, record: &ResourceRecord, cred: Credibility) {
        self.add_rrset(RRset::singleton(record), cred);
    }

    /// Record a negative result.  `rtype = None` means the whole name
    /// does not exist (NXDOMAIN); `Some(rtype)` means the name exists
    /// but has no RRset of that type (NXRRSET).  The TTL is the
    /// minimum of the authority `SOA`'s own TTL and its MINIMUM field,
    /// or zero (no caching) if there is no `SOA`.
    pub fn add_negative(
        &mut self,
        name: &DomainName,
        rtype: Option<RecordType>,
        soa: Option<&ResourceRecord>,
        cred: Credibility,
    ) {
        let key = match rtype {
            Some(rtype) => CacheKey::Type(rtype),
            None => CacheKey::NxDomain,
        };

        let ttl = soa
            .and_then(|rr| match &rr.rtype_with_data {
                RecordTypeWithData::SOA { minimum, .. } => Some(rr.ttl.min(*minimum)),
                _ => None,
            })
            .unwrap_or(0);

        let existing_cred = self.inner.get(name, &key).map(|(entry, _)| entry.cred());

        if ttl == 0 {
            if existing_cred.map_or(true, |ec| ec <= cred) {
                self.inner.remove(name, &key);
            }
            return;
        }

        if let Some(ec) = existing_cred {
            if ec > cred {
                return;
            }
        }

        self.inner.upsert(
            name.clone(),
            key,
            CacheEntry::Negative { cred },
            Duration::from_secs(ttl.into()),
        );
    }

    /// Remove every RRset at `(name, rtype)`.
    pub fn flush_set(&mut self, name: &DomainName, rtype: RecordType) {
        self.inner.remove(name, &CacheKey::Type(rtype));
    }

    /// Remove every entry for `name`.
    pub fn flush_name(&mut self, name: &DomainName) {
        self.inner.remove_partition(name);
    }

    /// Ingest every RRset in a response message.  Answers are grouped
    /// by `(owner, type)` into RRsets; credibility is `Auth` if the
    /// `AA` bit is set and `Normal` otherwise, except that glue
    /// (`ADDITIONAL` records not already asked for by the chain
    /// established via CNAME/DNAME) is admitted at `Glue`.
    ///
    /// Follows the in-message CNAME/DNAME chain starting at the
    /// question to find the name any negative result in the
    /// AUTHORITY section should be recorded under.
    pub fn add_message(&mut self, msg: &Message) {
        let base_cred = if msg.header.is_authoritative {
            Credibility::Auth
        } else {
            Credibility::Normal
        };

        let mut curname = msg.questions.first().map(|q| q.name.clone());
        let mut needs_glue: std::collections::HashSet<DomainName> = std::collections::HashSet::new();

        for group in group_by_owner_type(&msg.answers) {
            if let Some(name) = curname.clone() {
                match group.rrset.records.first() {
                    Some(RecordTypeWithData::CNAME { cname }) if name == group.owner => {
                        curname = Some(cname.clone());
                    }
                    Some(RecordTypeWithData::DNAME { dname })
                        if name.is_subdomain_of(&group.owner) =>
                    {
                        if let Some(synthesised) = name.from_dname(&group.owner, dname) {
                            curname = Some(synthesised);
                        }
                    }
                    _ => {}
                }
            }
            for rr in group.rrset.to_rrs() {
                if needs_glue_for(&rr) {
                    needs_glue.insert(glue_target(&rr));
                }
            }
            self.add_rrset(group.rrset, base_cred);
        }

        for group in group_by_owner_type(&msg.authority) {
            self.add_rrset(group.rrset, base_cred);
        }

        if msg.header.rcode == Rcode::NameError {
            if let Some(name) = &curname {
                let soa = msg
                    .authority
                    .iter()
                    .find(|rr| matches!(rr.rtype_with_data, RecordTypeWithData::SOA { .. }));
                self.add_negative(name, None, soa, base_cred);
            }
        }

        for rr in &msg.additional {
            if rr.rtype_with_data.rtype() == RecordType::OPT {
                continue;
            }
            if needs_glue.contains(&rr.name) {
                self.add_record(rr, Credibility::Glue);
            }
        }
    }

    /// Look up a name and type, at or above the given minimum
    /// credibility.
    ///
    /// Walks from `qname` towards the root.  At the exact name, an
    /// `ANY` query returns every credible positive RRset; a specific
    /// type returns that RRset, its NXRRSET negative, or chases a
    /// `CNAME`.  At an ancestor, a `DNAME` redirects the whole
    /// subtree.  Any RRset found (exact or ancestor) of type `NS`
    /// yields a delegation, and a cached NXDOMAIN at the exact name is
    /// the last resort.  Expired entries are evicted as they are
    /// found.
    pub fn lookup(&mut self, qname: &DomainName, qtype: QueryType, min_cred: Credibility) -> LookupResult {
        let labels = &qname.labels;
        for i in 0..labels.len() {
            let Some(tname) = DomainName::from_labels(labels[i..].to_vec()) else {
                continue;
            };
            let is_exact = i == 0;

            if is_exact && matches!(qtype, QueryType::Wildcard) {
                let rrsets = self.all_credible_at(&tname, min_cred);
                if !rrsets.is_empty() {
                    return LookupResult::Success(rrsets);
                }
            } else if is_exact {
                if let QueryType::Record(rtype) = qtype {
                    match self.inner.get(&tname, &CacheKey::Type(rtype)) {
                        Some((CacheEntry::Positive { rrset, cred }, _)) if *cred >= min_cred => {
                            return LookupResult::Success(vec![rrset.clone()]);
                        }
                        Some((CacheEntry::Negative { cred }, _)) if *cred >= min_cred => {
                            return LookupResult::NxRRset;
                        }
                        _ => {}
                    }
                    if let Some((CacheEntry::Positive { rrset, cred }, _)) =
                        self.inner.get(&tname, &CacheKey::Type(RecordType::CNAME))
                    {
                        if *cred >= min_cred {
                            return LookupResult::CName(rrset.clone());
                        }
                    }
                }
            } else if let Some((CacheEntry::Positive { rrset, cred }, _)) =
                self.inner.get(&tname, &CacheKey::Type(RecordType::DNAME))
            {
                if *cred >= min_cred {
                    return LookupResult::DName(rrset.clone());
                }
            }

            if let Some((CacheEntry::Positive { rrset, cred }, _)) =
                self.inner.get(&tname, &CacheKey::Type(RecordType::NS))
            {
                if *cred >= min_cred {
                    return LookupResult::Delegation(rrset.clone());
                }
            }

            if is_exact {
                if let Some((CacheEntry::Negative { cred }, _)) =
                    self.inner.get(&tname, &CacheKey::NxDomain)
                {
                    if *cred >= min_cred {
                        return LookupResult::NxDomain;
                    }
                }
            }
        }

        LookupResult::Unknown
    }

    /// Helper for `lookup`'s `ANY` case: every unexpired, credible
    /// positive RRset at `name`.
    fn all_credible_at(&mut self, name: &DomainName, min_cred: Credibility) -> Vec<RRset> {
        match self.inner.get_partition(name) {
            Some(entries) => entries
                .values()
                .filter_map(|(entry, _)| match entry {
                    CacheEntry::Positive { rrset, cred } if *cred >= min_cred => Some(rrset.clone()),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Clear expired entries and, if the cache has grown beyond its
    /// desired size, prunes names to get down to size.
    ///
    /// Returns `(has overflowed?, current size, num expired, num pruned)`.
    pub fn prune(&mut self) -> (bool, usize, usize, usize) {
        self.inner.prune()
    }
}

/// One `(owner, type)` group of answer/authority records, reduced to
/// an `RRset`.
struct Group {
    owner: DomainName,
    rrset: RRset,
}

fn group_by_owner_type(rrs: &[ResourceRecord]) -> Vec<Group> {
    let mut order = Vec::new();
    let mut groups: HashMap<(DomainName, RecordType), Vec<ResourceRecord>> = HashMap::new();
    for rr in rrs {
        if rr.rtype_with_data.rtype() == RecordType::OPT {
            continue;
        }
        let key = (rr.name.clone(), rr.rtype_with_data.rtype());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(rr.clone());
    }

    order
        .into_iter()
        .filter_map(|key| {
            let members = groups.remove(&key)?;
            let rrset = RRset::from_records(&members)?;
            Some(Group {
                owner: key.0,
                rrset,
            })
        })
        .collect()
}

/// Whether a record's target needs glue looked up in `ADDITIONAL`
/// (i.e. it names a server whose address the resolver will want).
fn needs_glue_for(rr: &ResourceRecord) -> bool {
    matches!(rr.rtype_with_data, RecordTypeWithData::NS { .. })
}

fn glue_target(rr: &ResourceRecord) -> DomainName {
    match &rr.rtype_with_data {
        RecordTypeWithData::NS { nsdname } => nsdname.clone(),
        _ => rr.name.clone(),
    }
}

#[derive(Debug, Clone)]
struct PartitionedCache<K1: Eq + Hash, K2: Eq + Hash, V> {
    /// Cached entries, indexed by partition key.
    partitions: HashMap<K1, Partition<K2, V>>,

    /// Priority queue of partition keys ordered by access times.
    ///
    /// When the cache is full and there are no expired records to prune,
    /// partitions will instead be pruned in LRU order.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `partitions`.
    access_priority: PriorityQueue<K1, Reverse<Instant>>,

    /// Priority queue of partition keys ordered by expiry time.
    ///
    /// When the cache is pruned, expired records are removed first.
    ///
    /// INVARIANT: the keys in here are exactly the keys in `partitions`.
    expiry_priority: PriorityQueue<K1, Reverse<Instant>>,

    /// The number of records in the cache, across all partitions.
    ///
    /// INVARIANT: this is the sum of the `size` fields of the `partitions`.
    current_size: usize,

    /// The desired maximum number of records in the cache.
    desired_size: usize,
}

/// The cached entries for a name.
#[derive(Debug, Clone, Eq, PartialEq)]
struct Partition<K: Eq + Hash, V> {
    /// The time this partition was last read at.
    last_read: Instant,

    /// When the next record expires.
    ///
    /// INVARIANT: this is the minimum of the expiry times of `records`.
    next_expiry: Instant,

    /// How many records there are.
    ///
    /// INVARIANT: this is `records.len()`.
    size: usize,

    /// At most one entry per record key (RFC 2181 section 5.4.1).
    records: HashMap<K, (V, Instant)>,
}

impl<K1: Clone + Eq + Hash, K2: Eq + Hash, V> Default for PartitionedCache<K1, K2, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K1: Clone + Eq + Hash, K2: Eq + Hash, V> PartitionedCache<K1, K2, V> {
    /// Create a new cache with a default desired size.
    pub fn new() -> Self {
        Self::with_desired_size(512)
    }

    /// Create a new cache with the given desired size.
    ///
    /// The `prune` method will remove expired records, and also enough records
    /// (in least-recently-used order) to get down to this size.
    pub fn with_desired_size(desired_size: usize) -> Self {
        Self {
            // `desired_size / 2` is a compromise: most partitions will have
            // more than one record, so `desired_size` would be too big for the
            // `partitions`.
            partitions: HashMap::with_capacity(desired_size / 2),
            access_priority: PriorityQueue::with_capacity(desired_size),
            expiry_priority: PriorityQueue::with_capacity(desired_size),
            current_size: 0,
            desired_size,
        }
    }

    /// Get the entry for `(partition_key, record_key)`, evicting it
    /// first if it has expired.
    pub fn get(&mut self, partition_key: &K1, record_key: &K2) -> Option<&(V, Instant)> {
        self.evict_if_expired(partition_key, record_key);

        let partition = self.partitions.get_mut(partition_key)?;
        let found = partition.records.contains_key(record_key);
        if found {
            partition.last_read = Instant::now();
            self.access_priority
                .change_priority(partition_key, Reverse(partition.last_read));
        }
        self.partitions.get(partition_key)?.records.get(record_key)
    }

    /// Get every entry in a name's partition, evicting expired ones
    /// first.
    pub fn get_partition(&mut self, partition_key: &K1) -> Option<&HashMap<K2, (V, Instant)>> {
        self.evict_expired_in_partition(partition_key);

        let partition = self.partitions.get_mut(partition_key)?;
        partition.last_read = Instant::now();
        self.access_priority
            .change_priority(partition_key, Reverse(partition.last_read));
        Some(&self.partitions.get(partition_key)?.records)
    }

    fn evict_if_expired(&mut self, partition_key: &K1, record_key: &K2) {
        let now = Instant::now();
        let Some(partition) = self.partitions.get_mut(partition_key) else {
            return;
        };
        let expired = matches!(partition.records.get(record_key), Some((_, expiry)) if *expiry <= now);
        if expired {
            partition.records.remove(record_key);
            partition.size -= 1;
            self.current_size -= 1;
            self.recompute_next_expiry(partition_key);
        }
    }

    fn evict_expired_in_partition(&mut self, partition_key: &K1) {
        let now = Instant::now();
        let Some(partition) = self.partitions.get_mut(partition_key) else {
            return;
        };
        let before = partition.records.len();
        partition.records.retain(|_, (_, expiry)| *expiry > now);
        let removed = before - partition.records.len();
        if removed > 0 {
            partition.size -= removed;
            self.current_size -= removed;
            self.recompute_next_expiry(partition_key);
        }
    }

    fn recompute_next_expiry(&mut self, partition_key: &K1) {
        let Some(partition) = self.partitions.get_mut(partition_key) else {
            return;
        };
        if let Some(min) = partition.records.values().map(|(_, e)| *e).min() {
            partition.next_expiry = min;
            self.expiry_priority
                .change_priority(partition_key, Reverse(min));
        } else {
            self.partitions.remove(partition_key);
            self.access_priority.remove(partition_key);
            self.expiry_priority.remove(partition_key);
        }
    }

    /// Insert or replace the entry at `(partition_key, record_key)`.
    pub fn upsert(&mut self, partition_key: K1, record_key: K2, value: V, ttl: Duration) {
        let now = Instant::now();
        let expiry = now + ttl;

        if let Some(partition) = self.partitions.get_mut(&partition_key) {
            let had_key = partition.records.contains_key(&record_key);
            partition.records.insert(record_key, (value, expiry));
            if !had_key {
                partition.size += 1;
                self.current_size += 1;
            }
            partition.last_read = now;
            self.access_priority
                .change_priority(&partition_key, Reverse(now));
            if expiry < partition.next_expiry {
                partition.next_expiry = expiry;
                self.expiry_priority
                    .change_priority(&partition_key, Reverse(expiry));
            }
        } else {
            let mut records = HashMap::new();
            records.insert(record_key, (value, expiry));
            let partition = Partition {
                last_read: now,
                next_expiry: expiry,
                size: 1,
                records,
            };
            self.access_priority
                .push(partition_key.clone(), Reverse(partition.last_read));
            self.expiry_priority
                .push(partition_key.clone(), Reverse(partition.next_expiry));
            self.partitions.insert(partition_key, partition);
            self.current_size += 1;
        }
    }

    /// Remove the entry at `(partition_key, record_key)`, if present.
    pub fn remove(&mut self, partition_key: &K1, record_key: &K2) {
        let Some(partition) = self.partitions.get_mut(partition_key) else {
            return;
        };
        if partition.records.remove(record_key).is_some() {
            partition.size -= 1;
            self.current_size -= 1;
            self.recompute_next_expiry(partition_key);
        }
    }

    /// Remove every entry for `partition_key`.
    pub fn remove_partition(&mut self, partition_key: &K1) {
        if let Some(partition) = self.partitions.remove(partition_key) {
            self.current_size -= partition.size;
            self.access_priority.remove(partition_key);
            self.expiry_priority.remove(partition_key);
        }
    }

    /// Delete all expired records.
    ///
    /// Returns the number of records deleted.
    pub fn remove_expired(&mut self) -> usize {
        let mut pruned = 0;

        loop {
            let before = pruned;
            pruned += self.remove_expired_step();
            if before == pruned {
                break;
            }
        }

        pruned
    }

    /// Delete all expired records, and then enough
    /// least-recently-used records to reduce the cache to the desired
    /// size.
    ///
    /// Returns `(has overflowed?, current size, num expired, num pruned)`.
    pub fn prune(&mut self) -> (bool, usize, usize, usize) {
        let has_overflowed = self.current_size > self.desired_size;
        let num_expired = self.remove_expired();
        let mut num_pruned = 0;

        while self.current_size > self.desired_size {
            num_pruned += self.remove_least_recently_used();
        }

        (has_overflowed, self.current_size, num_expired, num_pruned)
    }

    /// Helper for `remove_expired`: looks at the next-to-expire
    /// partition and cleans up expired entries from it.  This may
    /// delete more than one entry, and may even delete the whole
    /// partition.
    ///
    /// Returns the number of entries removed.
    fn remove_expired_step(&mut self) -> usize {
        if let Some((partition_key, Reverse(expiry))) = self.expiry_priority.pop() {
            let now = Instant::now();

            if expiry > now {
                self.expiry_priority.push(partition_key, Reverse(expiry));
                return 0;
            }

            if let Some(partition) = self.partitions.get_mut(&partition_key) {
                let before = partition.records.len();
                partition.records.retain(|_, (_, e)| *e > now);
                let pruned = before - partition.records.len();
                partition.size -= pruned;
                self.current_size -= pruned;

                if let Some(min) = partition.records.values().map(|(_, e)| *e).min() {
                    partition.next_expiry = min;
                    self.expiry_priority.push(partition_key, Reverse(min));
                } else {
                    self.partitions.remove(&partition_key);
                    self.access_priority.remove(&partition_key);
                }

                pruned
            } else {
                self.access_priority.remove(&partition_key);
                0
            }
        } else {
            0
        }
    }

    /// Helper for `prune`: deletes all entries associated with the
    /// least recently used name.
    ///
    /// Returns the number of entries removed.
    fn remove_least_recently_used(&mut self) -> usize {
        if let Some((partition_key, _)) = self.access_priority.pop() {
            self.expiry_priority.remove(&partition_key);

            if let Some(partition) = self.partitions.remove(&partition_key) {
                let pruned = partition.size;
                self.current_size -= pruned;
                pruned
            } else {
                0
            }
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_types::protocol::types::test_util::*;

    use super::*;

    fn a_rrset(name: &str, addr: Ipv4Addr, ttl: u32) -> RRset {
        let mut rr = a_record(name, addr);
        rr.ttl = ttl;
        RRset::singleton(&rr)
    }

    #[test]
    fn add_rrset_then_lookup_succeeds() {
        let mut cache = Cache::new();
        let rrset = a_rrset("www.example.", Ipv4Addr::new(1, 2, 3, 4), 300);
        cache.add_rrset(rrset.clone(), Credibility::Auth);

        match cache.lookup(
            &domain("www.example."),
            QueryType::Record(RecordType::A),
            Credibility::Normal,
        ) {
            LookupResult::Success(rrsets) => {
                assert_eq!(1, rrsets.len());
                assert_eq!(rrset.records, rrsets[0].records);
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn higher_credibility_is_not_overwritten() {
        let mut cache = Cache::new();
        cache.add_rrset(
            a_rrset("x.example.", Ipv4Addr::new(1, 1, 1, 1), 300),
            Credibility::Auth,
        );
        cache.add_rrset(
            a_rrset("x.example.", Ipv4Addr::new(9, 9, 9, 9), 300),
            Credibility::Normal,
        );

        match cache.lookup(
            &domain("x.example."),
            QueryType::Record(RecordType::A),
            Credibility::Normal,
        ) {
            LookupResult::Success(rrsets) => {
                assert_eq!(
                    vec![RecordTypeWithData::A {
                        address: Ipv4Addr::new(1, 1, 1, 1)
                    }],
                    rrsets[0].records
                );
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn credibility_replacement_swaps_in_more_credible_data() {
        let mut cache = Cache::new();
        cache.add_rrset(
            a_rrset("x.example.", Ipv4Addr::new(1, 2, 3, 4), 300),
            Credibility::Glue,
        );
        cache.add_rrset(
            a_rrset("x.example.", Ipv4Addr::new(5, 6, 7, 8), 300),
            Credibility::Auth,
        );

        match cache.lookup(
            &domain("x.example."),
            QueryType::Record(RecordType::A),
            Credibility::Normal,
        ) {
            LookupResult::Success(rrsets) => {
                assert_eq!(
                    vec![RecordTypeWithData::A {
                        address: Ipv4Addr::new(5, 6, 7, 8)
                    }],
                    rrsets[0].records
                );
            }
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[test]
    fn min_credibility_filters_out_low_quality_entries() {
        let mut cache = Cache::new();
        cache.add_rrset(
            a_rrset("x.example.", Ipv4Addr::new(1, 2, 3, 4), 300),
            Credibility::Glue,
        );

        assert_eq!(
            LookupResult::Unknown,
            cache.lookup(
                &domain("x.example."),
                QueryType::Record(RecordType::A),
                Credibility::Normal,
            )
        );
    }

    #[test]
    fn nxdomain_is_cached_and_expires() {
        let mut cache = Cache::new();
        let soa = ResourceRecord {
            name: domain("example."),
            rtype_with_data: RecordTypeWithData::SOA {
                mname: domain("ns1.example."),
                rname: domain("hostmaster.example."),
                serial: 1,
                refresh: 3600,
                retry: 600,
                expire: 86400,
                minimum: 60,
            },
            rclass: RecordClass::IN,
            ttl: 60,
        };
        cache.add_negative(&domain("bogus.example."), None, Some(&soa), Credibility::Auth);

        assert_eq!(
            LookupResult::NxDomain,
            cache.lookup(
                &domain("bogus.example."),
                QueryType::Record(RecordType::A),
                Credibility::Normal,
            )
        );
    }

    #[test]
    fn zero_ttl_rrset_deletes_existing_entry() {
        let mut cache = Cache::new();
        cache.add_rrset(
            a_rrset("x.example.", Ipv4Addr::new(1, 2, 3, 4), 300),
            Credibility::Normal,
        );
        cache.add_rrset(
            a_rrset("x.example.", Ipv4Addr::new(1, 2, 3, 4), 0),
            Credibility::Normal,
        );

        assert_eq!(
            LookupResult::Unknown,
            cache.lookup(
                &domain("x.example."),
                QueryType::Record(RecordType::A),
                Credibility::Normal,
            )
        );
    }

    #[test]
    fn delegation_is_found_for_a_strict_descendant() {
        let mut cache = Cache::new();
        let mut ns_rr = ns_record("example.", "ns1.example.");
        ns_rr.ttl = 300;
        cache.add_record(&ns_rr, Credibility::Auth);

        match cache.lookup(
            &domain("www.example."),
            QueryType::Record(RecordType::A),
            Credibility::Normal,
        ) {
            LookupResult::Delegation(rrset) => assert_eq!(RecordType::NS, rrset.rtype),
            other => panic!("expected Delegation, got {other:?}"),
        }
    }

    #[test]
    fn prune_evicts_least_recently_used_when_over_capacity() {
        let mut cache = Cache::with_desired_size(1);
        cache.add_rrset(
            a_rrset("a.example.", Ipv4Addr::new(1, 1, 1, 1), 300),
            Credibility::Normal,
        );
        cache.add_rrset(
            a_rrset("b.example.", Ipv4Addr::new(2, 2, 2, 2), 300),
            Credibility::Normal,
        );

        let (overflowed, current_size, _expired, pruned) = cache.prune();
        assert!(overflowed);
        assert_eq!(1, pruned);
        assert_eq!(1, current_size);
    }
}
