use std::{sync::OnceLock, time::Instant};

use actix_web::{
    body::{BodySize, MessageBody},
    dev::{ServiceRequest, ServiceResponse},
    http::header::CONTENT_LENGTH,
    middleware::Next,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use navigator::registry::IndexRegistry;

/// Installs the process-wide Prometheus recorder, returning the render
/// handle. Safe to call more than once; later calls return the same handle.
pub fn install() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install prometheus recorder");

            describe_gauge!("in_flight_requests", "Inflight requests being served.");
            describe_counter!("requests_total", "Total HTTP requests processed.");
            describe_histogram!(
                "request_duration_seconds",
                "HTTP request latencies in seconds."
            );
            describe_histogram!("response_size_bytes", "HTTP response sizes in bytes.");
            describe_histogram!("request_size_bytes", "HTTP request sizes in bytes.");
            describe_gauge!(
                "navigator_total_charts_served",
                "Charts being served by index"
            );
            describe_gauge!(
                "navigator_total_chart_versions_served",
                "Chart versions being served by index"
            );

            handle
        })
        .clone()
}

/// Instruments every request with the in-flight gauge, the per-code/method
/// request counter, and the duration and size distributions.
pub async fn middleware(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let method = req.method().to_string();
    let request_size = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or_default();

    gauge!("in_flight_requests").increment(1.0);
    let begin = Instant::now();
    let result = next.call(req).await;
    gauge!("in_flight_requests").decrement(1.0);

    let code = match &result {
        Ok(response) => response.status(),
        Err(e) => e.as_response_error().status_code(),
    };
    counter!("requests_total", "code" => code.as_u16().to_string(), "method" => method)
        .increment(1);
    histogram!("request_duration_seconds").record(begin.elapsed().as_secs_f64());
    histogram!("request_size_bytes").record(request_size as f64);
    if let Ok(response) = &result {
        if let BodySize::Sized(size) = response.response().body().size() {
            histogram!("response_size_bytes").record(size as f64);
        }
    }

    result
}

/// Republishes the per-index chart and chart-version gauges.
pub fn record_index_totals(registry: &IndexRegistry) {
    for name in registry.names() {
        if let Ok(index) = registry.get(&name) {
            let (charts, versions) = index.count();
            gauge!("navigator_total_charts_served", "index" => name.clone())
                .set(charts as f64);
            gauge!("navigator_total_chart_versions_served", "index" => name)
                .set(versions as f64);
        }
    }
}
