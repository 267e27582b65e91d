use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use log::*;
use tokio::net::TcpListener;
use tokio::time::Instant;

use crate::config::Config;
use crate::notifier::{Notification, Notifier};
use crate::IpSource;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const ERROR_BODY: &str = "Error: Could not retrieve external IP address\n";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Could not start server on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("IO Error: {0}")]
    IO(#[from] io::Error),
}

pub struct IpServer<S: IpSource> {
    tcp_listener: TcpListener,
    source: Arc<S>,
    notifier: Notifier,
}

impl<S: IpSource + 'static> IpServer<S> {
    pub async fn bind(
        host: &str,
        port: u16,
        source: Arc<S>,
        notifier: Notifier,
    ) -> Result<Self, ServerError> {
        let tcp_listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;
        info!("Successfully bound to {}", tcp_listener.local_addr()?);
        Ok(IpServer {
            tcp_listener,
            source,
            notifier,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_listener.local_addr()
    }

    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serves every method and path the same way until `signal` resolves.
    pub async fn serve_with_shutdown(
        self,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let local_addr = self.tcp_listener.local_addr()?;
        info!("Access http://{local_addr} to see your external IP");

        let state = AppState {
            source: self.source,
            notifier: self.notifier,
        };
        let app = Router::new()
            .fallback(handle_request::<S>)
            .with_state(state);

        axum::serve(
            self.tcp_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;
        info!("Server on {local_addr} stopped");
        Ok(())
    }
}

struct AppState<S> {
    source: Arc<S>,
    notifier: Notifier,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            source: self.source.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

async fn handle_request<S: IpSource + 'static>(
    State(state): State<AppState<S>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
) -> Response {
    let start = Instant::now();
    info!("{addr} - {method} {uri}");
    match state.source.resolve().await {
        Ok(ip) => {
            info!(
                "Served IP address {ip} to {addr} in {}ms",
                start.elapsed().as_millis()
            );
            (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_PLAIN)], format!("{ip}\n")).into_response()
        }
        Err(failure) => {
            error!("Failed to serve IP address to {addr}: {failure}");
            state
                .notifier
                .notify_detached(Notification::error("IP Server Error", failure.to_string()));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, TEXT_PLAIN)],
                ERROR_BODY,
            )
                .into_response()
        }
    }
}

/// Binds according to `config` and serves until `shutdown` resolves.
///
/// A bind failure is reported through the notifier before it is returned.
pub async fn run<S: IpSource + 'static>(
    config: &Config,
    source: Arc<S>,
    notifier: Notifier,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let server = match IpServer::bind(&config.host, config.port, source, notifier.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            notifier
                .notify(Notification::error("IP Server Startup Failed", e.to_string()))
                .await;
            return Err(e);
        }
    };
    server.serve_with_shutdown(shutdown).await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupt received, shutting down server"),
        _ = terminate => info!("Terminate signal received, shutting down server"),
    }
}
