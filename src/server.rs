// Server module - HTTP exposition of the registry
//
// Serves the Prometheus text format under the configured metrics path and
// a small HTML index on every other path. Gathering runs on the blocking
// pool because collectors perform synchronous upstream requests.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// State shared with every request handler
pub struct AppState {
    /// Registry holding the exporter's collectors
    pub registry: Registry,

    /// Path the index page links to
    pub metrics_path: String,
}

/// Builds the router for the given state
///
/// # Routes
/// - `GET <metrics_path>` - Prometheus text exposition
/// - anything else - HTML index linking to the metrics path
pub fn router(state: Arc<AppState>) -> Router {
    let metrics_path = state.metrics_path.clone();

    Router::new()
        .route(&metrics_path, get(metrics_handler))
        .fallback(index_handler)
        .with_state(state)
}

/// Serves requests on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Serving metrics on http://{}{}", addr, state.metrics_path);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Gathers every registered collector and renders the text format
pub fn encode_metrics(registry: &Registry) -> prometheus::Result<String> {
    let families = registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;

    // TextEncoder only ever writes UTF-8
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.registry.clone();

    match tokio::task::spawn_blocking(move || encode_metrics(&registry)).await {
        Ok(Ok(body)) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Ok(Err(e)) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!("Metrics gathering task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(index_page(&state.metrics_path))
}

fn index_page(metrics_path: &str) -> String {
    format!(
        "<html>\n\
         <head><title>Nightscout exporter</title></head>\n\
         <body>\n\
         <h1>nightscout exporter</h1>\n\
         <p><a href='{}'>Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        metrics_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::NightscoutCollector;
    use crate::fetcher::PebbleFetcher;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::runtime::Runtime;

    const FAMILY: &str = "nightscout_nightscout_pebble";

    /// Starts a fake Nightscout serving `body` at /pebble
    fn spawn_upstream(rt: &Runtime, body: &'static str) -> SocketAddr {
        rt.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = Router::new().route(
                "/pebble",
                get(move || async move { ([(header::CONTENT_TYPE, "application/json")], body) }),
            );
            tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
            addr
        })
    }

    /// Starts the exporter scraping `upstream_url`, returns its address
    fn spawn_exporter(rt: &Runtime, upstream_url: &str) -> SocketAddr {
        // The blocking client is built outside the runtime
        let fetcher = PebbleFetcher::new(Duration::from_secs(2)).unwrap();
        let collector = NightscoutCollector::new(upstream_url, fetcher).unwrap();

        let registry = Registry::new();
        registry.register(Box::new(collector)).unwrap();

        let state = Arc::new(AppState {
            registry,
            metrics_path: "/metrics".to_string(),
        });

        rt.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(serve(listener, state, std::future::pending()));
            addr
        })
    }

    fn scrape(addr: SocketAddr, path: &str) -> (u16, String) {
        let response = reqwest::blocking::get(format!("http://{}{}", addr, path)).unwrap();
        let status = response.status().as_u16();
        (status, response.text().unwrap())
    }

    fn sample_lines(body: &str) -> Vec<&str> {
        body.lines()
            .filter(|line| line.starts_with(FAMILY))
            .collect()
    }

    #[test]
    fn test_numeric_reading_end_to_end() {
        let rt = Runtime::new().unwrap();
        let upstream = spawn_upstream(&rt, r#"{"bgs":[{"sgv":"120"}]}"#);
        let url = format!("http://{}/pebble", upstream);
        let exporter = spawn_exporter(&rt, &url);

        let (status, body) = scrape(exporter, "/metrics");

        assert_eq!(status, 200);
        assert!(body.contains("# TYPE nightscout_nightscout_pebble gauge"));
        assert_eq!(
            sample_lines(&body),
            vec![format!(
                "nightscout_nightscout_pebble{{glucosetype=\"mgdl\",url=\"{}\"}} 120",
                url
            )]
        );
    }

    #[test]
    fn test_empty_readings_end_to_end() {
        let rt = Runtime::new().unwrap();
        let upstream = spawn_upstream(&rt, r#"{"bgs":[]}"#);
        let exporter = spawn_exporter(&rt, &format!("http://{}/pebble", upstream));

        let (status, body) = scrape(exporter, "/metrics");

        assert_eq!(status, 200);
        assert!(sample_lines(&body).is_empty());
    }

    #[test]
    fn test_unreachable_upstream_end_to_end() {
        let rt = Runtime::new().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let exporter = spawn_exporter(&rt, &format!("http://{}/pebble", dead));

        // Twice, to show the exporter survives the failure
        for _ in 0..2 {
            let (status, body) = scrape(exporter, "/metrics");
            assert_eq!(status, 200);
            assert!(sample_lines(&body).is_empty());
        }
    }

    #[test]
    fn test_non_numeric_reading_end_to_end() {
        let rt = Runtime::new().unwrap();
        let upstream = spawn_upstream(&rt, r#"{"bgs":[{"sgv":"abc"}]}"#);
        let exporter = spawn_exporter(&rt, &format!("http://{}/pebble", upstream));

        let (status, body) = scrape(exporter, "/metrics");

        assert_eq!(status, 200);
        assert!(sample_lines(&body).is_empty());
    }

    #[test]
    fn test_malformed_json_end_to_end() {
        let rt = Runtime::new().unwrap();
        let upstream = spawn_upstream(&rt, "{\"bgs\": [");
        let exporter = spawn_exporter(&rt, &format!("http://{}/pebble", upstream));

        let (status, body) = scrape(exporter, "/metrics");

        assert_eq!(status, 200);
        assert!(sample_lines(&body).is_empty());
    }

    #[test]
    fn test_index_page() {
        let rt = Runtime::new().unwrap();
        let upstream = spawn_upstream(&rt, r#"{"bgs":[]}"#);
        let exporter = spawn_exporter(&rt, &format!("http://{}/pebble", upstream));

        let (status, body) = scrape(exporter, "/");
        assert_eq!(status, 200);
        assert!(body.contains("<title>Nightscout exporter</title>"));
        assert!(body.contains("<a href='/metrics'>Metrics</a>"));

        // Unknown paths fall through to the index
        let (status, body) = scrape(exporter, "/anything/else");
        assert_eq!(status, 200);
        assert!(body.contains("<a href='/metrics'>Metrics</a>"));
    }

    #[test]
    fn test_index_links_custom_path() {
        assert!(index_page("/probe").contains("<a href='/probe'>Metrics</a>"));
    }

    #[test]
    fn test_encode_empty_registry() {
        assert_eq!(encode_metrics(&Registry::new()).unwrap(), "");
    }
}
