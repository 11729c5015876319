use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct Metrics {
    // Sessions
    pub entity_reads_total: AtomicU64,
    pub entity_writes_total: AtomicU64,

    // Provider queries
    pub queries_total: AtomicU64,
    pub query_duration_micros_total: AtomicU64,
    pub slow_queries_total: AtomicU64,

    // Mutations
    pub rollbacks_total: AtomicU64,
    pub detach_fallbacks_total: AtomicU64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub fn record_entity_read() {
    metrics().entity_reads_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_entity_write() {
    metrics().entity_writes_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_query_duration(elapsed: Duration) {
    let m = metrics();
    m.queries_total.fetch_add(1, Ordering::Relaxed);
    m.query_duration_micros_total.fetch_add(
        u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );
}

pub fn record_slow_query() {
    metrics().slow_queries_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_rollback() {
    metrics().rollbacks_total.fetch_add(1, Ordering::Relaxed);
}

pub fn record_detach_fallback() {
    metrics().detach_fallbacks_total.fetch_add(1, Ordering::Relaxed);
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    let counters = [
        ("entity_reads_total", &m.entity_reads_total),
        ("entity_writes_total", &m.entity_writes_total),
        ("queries_total", &m.queries_total),
        ("query_duration_micros_total", &m.query_duration_micros_total),
        ("slow_queries_total", &m.slow_queries_total),
        ("rollbacks_total", &m.rollbacks_total),
        ("detach_fallbacks_total", &m.detach_fallbacks_total),
    ];
    for (name, value) in counters {
        let _ = writeln!(
            s,
            "# TYPE {name} counter\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    s
}
