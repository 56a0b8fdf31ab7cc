//! Cache metrics
//!
//! Counters are emitted through the `metrics` facade; the embedding
//! application decides whether to install a recorder.

/// Record a verified cache hit
pub fn record_cache_hit(model: &str) {
    metrics::counter!("gluon_model_store_cache_hits_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a fetch from the remote repository
pub fn record_fetch(model: &str) {
    metrics::counter!("gluon_model_store_fetches_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a fetch triggered by a cached file failing verification
pub fn record_refetch(model: &str) {
    metrics::counter!("gluon_model_store_refetches_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a downloaded file failing verification
pub fn record_integrity_failure(model: &str) {
    metrics::counter!("gluon_model_store_integrity_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record parameter files removed by a purge
pub fn record_purged(count: usize) {
    metrics::counter!("gluon_model_store_purged_files_total").increment(count as u64);
}
