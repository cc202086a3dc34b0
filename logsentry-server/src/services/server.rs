use std::net::TcpListener;
use std::sync::Arc;

use axum::http::{HeaderValue, header};
use axum_server::Handle;
use logsentry_config::Config;
use logsentry_system::{Controller, Receiver, Service, Shutdown};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::endpoints;
use crate::middlewares;
use crate::service::ServiceState;
use crate::statsd::ServerCounters;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] std::io::Error),
}

/// Builds the axum application with all routes and middleware.
///
/// Exposed so that tests can drive the endpoints without binding a socket.
pub fn make_app(state: ServiceState) -> axum::Router {
    let middleware = ServiceBuilder::new()
        .layer(axum::middleware::from_fn(middlewares::ingested_at))
        .layer(CatchPanicLayer::custom(middlewares::handle_panic))
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static("logsentry"),
        ));

    endpoints::routes(state.config()).layer(middleware).with_state(state)
}

/// HTTP server service.
///
/// This is the main HTTP server which hosts all [services](ServiceState) and
/// dispatches incoming traffic to them. The server stops when a [`Shutdown`]
/// is triggered.
pub struct HttpServer {
    config: Arc<Config>,
    state: ServiceState,
    listener: TcpListener,
}

impl HttpServer {
    /// Binds the configured interface and prepares the server.
    pub fn new(config: Arc<Config>, state: ServiceState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen_addr())?;
        listener.set_nonblocking(true)?;

        Ok(Self {
            config,
            state,
            listener,
        })
    }

    /// Returns the actual bound address, useful with an OS-assigned port.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }
}

impl Service for HttpServer {
    type Interface = ();

    fn spawn_handler(self, _rx: Receiver<Self::Interface>) {
        let Self {
            config,
            state,
            listener,
        } = self;

        logsentry_log::info!("spawning http server");
        logsentry_log::info!("  listening on http://{}/", config.listen_addr());
        logsentry_statsd::metric!(counter(ServerCounters::ServerStarting) += 1);

        let handle = Handle::new();

        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            let Shutdown { timeout } = Controller::shutdown_handle().notified().await;
            logsentry_log::info!("shutting down HTTP server");

            match timeout {
                Some(timeout) => shutdown_handle.graceful_shutdown(Some(timeout)),
                None => shutdown_handle.shutdown(),
            }
        });

        tokio::spawn(async move {
            let app = make_app(state);
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .expect("failed to start axum server");
        });
    }

    fn name() -> &'static str {
        "http_server"
    }
}
