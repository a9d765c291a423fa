use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

pub static CHAT_TURNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CHAT_TOKENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static LOGINS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static COMPACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Register every collector. Calling it again is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;
    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;
    let turns_total = IntCounterVec::new(
        Opts::new("chat_turns_total", "Chat turns by mode and outcome"),
        &["mode", "outcome"],
    )?;
    let tokens_total = IntCounterVec::new(
        Opts::new("chat_tokens_total", "Tokens reported by the completion API"),
        &["kind"],
    )?;
    let logins_total = IntCounterVec::new(
        Opts::new("chat_logins_total", "Sign-in attempts by outcome"),
        &["outcome"],
    )?;
    let compactions_total = IntCounterVec::new(
        Opts::new("chat_compactions_total", "Conversation compactions by outcome"),
        &["outcome"],
    )?;

    registry.register(Box::new(requests_total.clone()))?;
    registry.register(Box::new(request_duration.clone()))?;
    registry.register(Box::new(turns_total.clone()))?;
    registry.register(Box::new(tokens_total.clone()))?;
    registry.register(Box::new(logins_total.clone()))?;
    registry.register(Box::new(compactions_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = HTTP_REQUESTS_TOTAL.set(requests_total);
    let _ = HTTP_REQUEST_DURATION_SECONDS.set(request_duration);
    let _ = CHAT_TURNS_TOTAL.set(turns_total);
    let _ = CHAT_TOKENS_TOTAL.set(tokens_total);
    let _ = LOGINS_TOTAL.set(logins_total);
    let _ = COMPACTIONS_TOTAL.set(compactions_total);

    Ok(())
}

pub fn get_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_http_request(method: &str, path: &str, status: &str, seconds: f64) {
    let labels = [method, path, status];
    if let Some(counter) = HTTP_REQUESTS_TOTAL.get() {
        counter.with_label_values(&labels).inc();
    }
    if let Some(histogram) = HTTP_REQUEST_DURATION_SECONDS.get() {
        histogram.with_label_values(&labels).observe(seconds);
    }
}

pub fn record_turn(mode: &str, outcome: &str) {
    if let Some(counter) = CHAT_TURNS_TOTAL.get() {
        counter.with_label_values(&[mode, outcome]).inc();
    }
}

pub fn record_tokens(prompt: u32, completion: u32) {
    if let Some(counter) = CHAT_TOKENS_TOTAL.get() {
        counter.with_label_values(&["prompt"]).inc_by(u64::from(prompt));
        counter.with_label_values(&["completion"]).inc_by(u64::from(completion));
    }
}

pub fn record_login(outcome: &str) {
    if let Some(counter) = LOGINS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_compaction(outcome: &str) {
    if let Some(counter) = COMPACTIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}
