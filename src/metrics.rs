use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub receiver_uploads_total: Counter,
    pub receiver_upload_bytes_total: Counter,
    pub receiver_upload_rejected_total: CounterVec,
    pub receiver_scrape_count_total: Counter,
    pub receiver_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let receiver_uploads_total = Counter::with_opts(opts!(
            "receiver_uploads_total",
            "Artifacts stored by the receiver"
        ))?;
        let receiver_upload_bytes_total = Counter::with_opts(opts!(
            "receiver_upload_bytes_total",
            "Bytes of stored artifacts"
        ))?;
        let receiver_upload_rejected_total = CounterVec::new(
            opts!(
                "receiver_upload_rejected_total",
                "Uploads refused by the receiver, by reason"
            ),
            &["reason"],
        )?;
        let receiver_scrape_count_total = Counter::with_opts(opts!(
            "receiver_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let receiver_uptime_seconds = Gauge::with_opts(opts!(
            "receiver_uptime_seconds",
            "Seconds since the receiver started"
        ))?;

        register(&registry, &receiver_uploads_total)?;
        register(&registry, &receiver_upload_bytes_total)?;
        register(&registry, &receiver_upload_rejected_total)?;
        register(&registry, &receiver_scrape_count_total)?;
        register(&registry, &receiver_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            receiver_uploads_total,
            receiver_upload_bytes_total,
            receiver_upload_rejected_total,
            receiver_scrape_count_total,
            receiver_uptime_seconds,
        }))
    }

    pub fn inc_stored(&self, bytes: u64) {
        self.receiver_uploads_total.inc();
        self.receiver_upload_bytes_total.inc_by(bytes as f64);
    }

    pub fn inc_rejected(&self, reason: &str) {
        self.receiver_upload_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.receiver_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.receiver_uptime_seconds.set(uptime);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
