use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::future::ready;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Serves the Prometheus scrape endpoint. Counters come from the
/// listeners and the recorder; nothing here is on the data path.
pub(crate) async fn serve_console(endpoint: SocketAddr) -> anyhow::Result<()> {
    let recorder_handle = setup_metrics_recorder()?;
    let app = console_app(recorder_handle);

    let listener = TcpListener::bind(endpoint).await?;
    tracing::info!("metrics console on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn console_app(recorder_handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || ready(recorder_handle.render())))
}

fn setup_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    Ok(handle)
}
