use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use dns_types::protocol::types::*;
use dns_types::rrset::{Credibility, RRset};

use dns_resolver::cache::Cache;

#[allow(non_snake_case)]
fn bench__add_rrset__unique(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_rrset/unique");
    for size in [1, 100, 1000] {
        let (rrsets, _) = make_rrsets(size, 300);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rrsets, |b, rrsets| {
            b.iter(|| build_cache(size, rrsets));
        });
    }
    group.finish();
}

#[allow(non_snake_case)]
fn bench__add_rrset__duplicate(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_rrset/duplicate");
    for size in [1, 100, 1000] {
        let name1 = DomainName::from_dotted_string("www.source.example.com.").unwrap();
        let name2 = DomainName::from_dotted_string("www.target.example.com.").unwrap();
        let rr = ResourceRecord {
            name: name1,
            rtype_with_data: RecordTypeWithData::CNAME { cname: name2 },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let rrset = RRset::singleton(&rr);
        let rrsets: Vec<RRset> = (0..size).map(|_| rrset.clone()).collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rrsets, |b, rrsets| {
            b.iter(|| build_cache(size, rrsets));
        });
    }
    group.finish();
}

#[allow(non_snake_case)]
fn bench__lookup__hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup/hit");
    for size in [1, 100, 1000] {
        let (rrsets, queries) = make_rrsets(size, 300);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rrsets, |b, rrsets| {
            b.iter_batched(
                || build_cache(size, rrsets),
                |mut cache| {
                    for (name, rtype) in &queries {
                        cache.lookup(name, QueryType::Record(*rtype), Credibility::Normal);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

#[allow(non_snake_case)]
fn bench__lookup__miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup/miss");
    for size in [1, 100, 1000] {
        let (rrsets, queries) = make_rrsets(size, 300);
        let name = DomainName::from_dotted_string(
            "name.which.is.unlikely.to.coincidentally.be.randomly.generated.",
        )
        .unwrap();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rrsets, |b, rrsets| {
            b.iter_batched(
                || build_cache(size, rrsets),
                |mut cache| {
                    for (_, rtype) in &queries {
                        cache.lookup(&name, QueryType::Record(*rtype), Credibility::Normal);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

#[allow(non_snake_case)]
fn bench__prune(c: &mut Criterion) {
    let mut group = c.benchmark_group("prune");
    for size in [1, 100, 1000] {
        let (rrsets, _) = make_rrsets(size + 1, 300);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rrsets, |b, rrsets| {
            b.iter_batched(
                || build_cache(1, rrsets),
                |mut cache| cache.prune(),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn build_cache(size: usize, rrsets: &[RRset]) -> Cache {
    let mut cache = Cache::with_desired_size(size);
    for rrset in rrsets {
        cache.add_rrset(rrset.clone(), Credibility::Auth);
    }
    cache
}

fn make_rrsets(size: usize, ttl: u32) -> (Vec<RRset>, Vec<(DomainName, RecordType)>) {
    let mut rrsets = Vec::with_capacity(size);
    let mut queries = Vec::with_capacity(size);

    for i in 0..size {
        let name1 =
            DomainName::from_dotted_string(&format!("www-{:?}.source.example.com.", i / 2))
                .unwrap();
        let name2 =
            DomainName::from_dotted_string(&format!("www-{:?}.target.example.com.", i / 2))
                .unwrap();

        if i % 2 == 0 {
            queries.push((name1.clone(), RecordType::CNAME));
            let rr = ResourceRecord {
                name: name1,
                rtype_with_data: RecordTypeWithData::CNAME { cname: name2 },
                rclass: RecordClass::IN,
                ttl,
            };
            rrsets.push(RRset::singleton(&rr));
        } else {
            queries.push((name1.clone(), RecordType::NS));
            let rr = ResourceRecord {
                name: name1,
                rtype_with_data: RecordTypeWithData::NS { nsdname: name2 },
                rclass: RecordClass::IN,
                ttl,
            };
            rrsets.push(RRset::singleton(&rr));
        };
    }

    (rrsets, queries)
}

criterion_group!(
    benches,
    bench__add_rrset__unique,
    bench__add_rrset__duplicate,
    bench__lookup__hit,
    bench__lookup__miss,
    bench__prune
);
criterion_main!(benches);
