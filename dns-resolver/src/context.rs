use dns_types::protocol::types::*;
use dns_types::zones::types::Zones;

use crate::cache::SharedCache;
use crate::metrics::Metrics;

/// Per-request state threaded through a single response composition: the
/// zones and cache to consult, plus a loop-detecting question stack for
/// CNAME/DNAME chasing and the metrics accumulated along the way.
pub struct Context<'a> {
    pub zones: &'a Zones,
    pub cache: &'a SharedCache,
    question_stack: Vec<Question>,
    metrics: Metrics,
}

impl<'a> Context<'a> {
    pub fn new(zones: &'a Zones, cache: &'a SharedCache, chase_limit: usize) -> Self {
        Self {
            zones,
            cache,
            question_stack: Vec::with_capacity(chase_limit),
            metrics: Metrics::new(),
        }
    }

    pub fn metrics(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    pub fn done(self) -> Metrics {
        self.metrics
    }

    /// `true` once the CNAME/DNAME chase has gone as deep as the
    /// configured limit, so a responder can stop following and emit a
    /// partial answer instead.
    pub fn at_chase_limit(&self) -> bool {
        self.question_stack.len() == self.question_stack.capacity()
    }

    pub fn is_duplicate_question(&self, question: &Question) -> bool {
        self.question_stack.contains(question)
    }

    pub fn push_question(&mut self, question: &Question) {
        self.question_stack.push(question.clone());
    }

    pub fn pop_question(&mut self) {
        self.question_stack.pop();
    }
}
