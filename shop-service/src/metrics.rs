use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("http_errors_total", "Count of HTTP error responses emitted (status >= 400)"),
        &["service", "code", "status"],
    ).unwrap();
    REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static ORDERS_CREATED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("orders_created_total", "Orders created through checkout initiation").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SETTLEMENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("settlements_total", "Gateway callback settlement outcomes"),
        &["outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static ALLOCATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("card_allocations_total", "Card allocation outcomes during fulfillment"),
        &["outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static REFUNDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("refunds_total", "Refund outcomes"),
        &["outcome"],
    ).unwrap();
    REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static INTEGRITY_VIOLATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("integrity_violations_total", "Operations refused on an inconsistent order/card pair; alert on any increase"),
        &["kind"],
    ).unwrap();
    REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub static INTEGRITY_ORPHANS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let v = IntGaugeVec::new(
        Opts::new("integrity_orphans", "Orphaned order/card states currently present, per sweeper pass"),
        &["kind"],
    ).unwrap();
    REGISTRY.register(Box::new(v.clone())).ok();
    v
});

pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).to_string()
}
