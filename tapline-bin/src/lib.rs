use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tapline_config::Config;
use tapline_core::run_proxy;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

pub async fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    // Initialize logging
    fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("tapline_core=debug".parse()?),
        )
        .with_target(false)
        .json()
        .init();

    // Load configuration
    let config = Config::from_file(config_path)?;
    info!(path = %config_path.display(), "Loaded configuration");

    // Set up metrics
    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        serve_metrics(metrics_addr, registry.clone()).await?;
        Some(registry)
    } else {
        None
    };

    // Run the proxy
    run_proxy(config, registry).await?;

    Ok(())
}

/// Serves the registry in text exposition format on every path of `addr`
///
/// Returns the bound address once the listener is up.
pub async fn serve_metrics(addr: SocketAddr, registry: Registry) -> Result<SocketAddr, Box<dyn Error>> {
    let metrics_listener = TcpListener::bind(addr).await?;
    let bound = metrics_listener.local_addr()?;
    info!("Metrics server listening on {}", bound);

    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = metrics_listener.accept().await {
                let registry = registry.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    let service =
                        hyper::service::service_fn(move |_req: Request<hyper::body::Incoming>| {
                            let registry = registry.clone();
                            async move {
                                let encoder = TextEncoder::new();
                                let metric_families = registry.gather();
                                let mut buffer = vec![];
                                encoder
                                    .encode(&metric_families, &mut buffer)
                                    .map_err(|e| format!("Metrics encoding error: {}", e))?;
                                Ok::<_, String>(Response::new(Full::new(bytes::Bytes::from(
                                    buffer,
                                ))))
                            }
                        });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "Metrics connection error");
                    }
                });
            }
        }
    });

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::IntCounter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_metrics_endpoint_serves_registry() {
        let registry = Registry::new();
        let counter = IntCounter::new("tapline_test_total", "test counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc_by(7);

        let addr = serve_metrics("127.0.0.1:0".parse().unwrap(), registry)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("tapline_test_total 7"));
    }
}
