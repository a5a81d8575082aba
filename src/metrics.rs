//! Minimal metrics scaffolding: atomic counters for the request/response
//! round-trips (admin settings, traceroute) and the message-ack pipeline.
//! No exposition format is wired up; `snapshot()` is read by the `status`
//! CLI subcommand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
static MESSAGES_ACKED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_FAILED: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

static ADMIN_ROUNDTRIP_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ADMIN_ROUNDTRIP_COUNT: AtomicU64 = AtomicU64::new(0);

static TRACEROUTE_COMPLETED: AtomicU64 = AtomicU64::new(0);
static TRACEROUTE_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static TRACEROUTE_DURATION_SUM_MS: AtomicU64 = AtomicU64::new(0);
static TRACEROUTE_DURATION_COUNT: AtomicU64 = AtomicU64::new(0);

#[allow(dead_code)]
pub fn inc_message_sent() {
    MESSAGES_SENT.fetch_add(1, Ordering::Relaxed);
}
#[allow(dead_code)]
pub fn inc_message_acked() {
    MESSAGES_ACKED.fetch_add(1, Ordering::Relaxed);
}
#[allow(dead_code)]
pub fn inc_message_failed() {
    MESSAGES_FAILED.fetch_add(1, Ordering::Relaxed);
}
#[allow(dead_code)]
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[allow(dead_code)]
pub fn observe_admin_roundtrip(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ADMIN_ROUNDTRIP_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ADMIN_ROUNDTRIP_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[allow(dead_code)]
pub fn observe_traceroute_completed(duration_ms: i64) {
    TRACEROUTE_COMPLETED.fetch_add(1, Ordering::Relaxed);
    if duration_ms > 0 {
        TRACEROUTE_DURATION_SUM_MS.fetch_add(duration_ms as u64, Ordering::Relaxed);
        TRACEROUTE_DURATION_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}
#[allow(dead_code)]
pub fn inc_traceroute_timed_out() {
    TRACEROUTE_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub messages_sent: u64,
    pub messages_acked: u64,
    pub messages_failed: u64,
    pub ack_latency_avg_ms: Option<u64>,
    pub admin_roundtrip_avg_ms: Option<u64>,
    pub traceroute_completed: u64,
    pub traceroute_timed_out: u64,
    pub traceroute_duration_avg_ms: Option<u64>,
}

fn avg(sum: &AtomicU64, count: &AtomicU64) -> Option<u64> {
    let count = count.load(Ordering::Relaxed);
    if count == 0 {
        None
    } else {
        Some(sum.load(Ordering::Relaxed) / count)
    }
}

#[allow(dead_code)]
pub fn snapshot() -> Snapshot {
    Snapshot {
        messages_sent: MESSAGES_SENT.load(Ordering::Relaxed),
        messages_acked: MESSAGES_ACKED.load(Ordering::Relaxed),
        messages_failed: MESSAGES_FAILED.load(Ordering::Relaxed),
        ack_latency_avg_ms: avg(&ACK_LATENCY_SUM_MS, &ACK_LATENCY_COUNT),
        admin_roundtrip_avg_ms: avg(&ADMIN_ROUNDTRIP_SUM_MS, &ADMIN_ROUNDTRIP_COUNT),
        traceroute_completed: TRACEROUTE_COMPLETED.load(Ordering::Relaxed),
        traceroute_timed_out: TRACEROUTE_TIMED_OUT.load(Ordering::Relaxed),
        traceroute_duration_avg_ms: avg(&TRACEROUTE_DURATION_SUM_MS, &TRACEROUTE_DURATION_COUNT),
    }
}
