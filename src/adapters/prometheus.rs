//! Prometheus Exposition Adapter
//!
//! Renders [`CacheStats`] in the Prometheus text format. Each call builds a
//! private registry, so several services can be rendered side by side.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

use crate::cache::CacheStats;
use crate::error::{Error, Result};

/// Metric name prefix
const PREFIX: &str = "couchecache";

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Prometheus metric error: {}", e))
}

/// Stats renderer
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    prefix: String,
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self {
            prefix: PREFIX.to_string(),
        }
    }
}

impl PrometheusExporter {
    /// Exporter with a custom metric prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Text exposition of `stats`
    pub fn render(&self, stats: &CacheStats) -> Result<String> {
        let registry = Registry::new();
        let c = &stats.counters;

        let counters: [(&str, &str, u64); 13] = [
            ("hits_total", "Reads served from either tier", c.hits),
            ("misses_total", "Reads that found nothing usable", c.misses),
            ("memory_hits_total", "Reads served from the memory tier", c.memory_hits),
            ("durable_hits_total", "Reads served from the durable tier", c.durable_hits),
            ("sets_total", "Writes", c.sets),
            ("deletes_total", "Deleted keys", c.deletes),
            ("errors_total", "Absorbed internal failures", c.errors),
            ("background_refreshes_total", "Drained refresh items", c.background_refreshes),
            ("compressions_total", "Encoded durable writes", c.compressions),
            ("stale_hits_total", "Stale values served with a refresh queued", c.stale_hits),
            ("evictions_total", "Memory tier capacity evictions", c.evictions),
            ("warmed_total", "Keys resolved by the warming queue", c.warmed),
            ("preloaded_total", "Keys stored by preload", c.preloaded),
        ];

        for (name, help, value) in counters {
            let counter = IntCounter::new(format!("{}_{}", self.prefix, name), help)
                .map_err(metric_error)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(metric_error)?;
        }

        let gauges: [(&str, &str, i64); 7] = [
            ("memory_entries", "Entries in the memory tier", stats.memory_size as i64),
            ("memory_capacity", "Memory tier capacity", stats.memory_max_size as i64),
            ("refresh_queue_length", "Pending refresh items", stats.refresh_queue_len as i64),
            ("warming_queue_length", "Pending warming items", stats.warming_queue_len as i64),
            ("read_latency_microseconds", "Read latency moving average", stats.avg_read_latency_us as i64),
            ("write_latency_microseconds", "Write latency moving average", stats.avg_write_latency_us as i64),
            ("durable_available", "1 when the durable tier is attached", stats.durable_available as i64),
        ];

        for (name, help, value) in gauges {
            let gauge = IntGauge::new(format!("{}_{}", self.prefix, name), help)
                .map_err(metric_error)?;
            gauge.set(value);
            registry.register(Box::new(gauge)).map_err(metric_error)?;
        }

        let hit_rate = Gauge::new(format!("{}_hit_rate", self.prefix), "hits / (hits + misses)")
            .map_err(metric_error)?;
        hit_rate.set(stats.hit_rate);
        registry.register(Box::new(hit_rate)).map_err(metric_error)?;

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&registry.gather(), &mut buffer)
            .map_err(metric_error)?;

        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnalyticsCounters;

    fn stats() -> CacheStats {
        CacheStats {
            counters: AnalyticsCounters {
                hits: 3,
                misses: 1,
                ..Default::default()
            },
            hit_rate: 0.75,
            avg_read_latency_us: 12,
            avg_write_latency_us: 40,
            memory_size: 2,
            memory_max_size: 200,
            refresh_queue_len: 0,
            warming_queue_len: 1,
            durable_available: true,
        }
    }

    #[test]
    fn test_render_counters_and_gauges() {
        let text = PrometheusExporter::default().render(&stats()).unwrap();

        assert!(text.contains("couchecache_hits_total 3"));
        assert!(text.contains("couchecache_misses_total 1"));
        assert!(text.contains("couchecache_memory_capacity 200"));
        assert!(text.contains("couchecache_hit_rate 0.75"));
        assert!(text.contains("couchecache_durable_available 1"));
    }

    #[test]
    fn test_custom_prefix() {
        let text = PrometheusExporter::with_prefix("app_cache")
            .render(&stats())
            .unwrap();
        assert!(text.contains("app_cache_warming_queue_length 1"));
    }

    #[test]
    fn test_render_twice() {
        let exporter = PrometheusExporter::default();
        assert!(exporter.render(&stats()).is_ok());
        assert!(exporter.render(&stats()).is_ok());
    }
}
