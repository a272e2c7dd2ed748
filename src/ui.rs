use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, routing::method_routing, Json};
use serde::Serialize;
use sockrelay_model::Destination;
use tokio::{io, net::TcpListener};
use tracing::info;
use tracing_error::{InstrumentError, TracedError};

use crate::{
    config::schema::UiServerConfig,
    controller::{Controller, ControllerStatus},
    session::SessionSnapshot,
};

pub fn router(
    controller: Arc<Controller>,
    #[cfg(feature = "metrics")] registry: Arc<prometheus_client::registry::Registry>,
) -> axum::Router {
    let router = axum::Router::new()
        .route("/-/status", method_routing::get(status))
        .route("/-/connections", method_routing::get(connections))
        .with_state(controller);

    #[cfg(feature = "metrics")]
    let router = router.route(
        "/metrics",
        method_routing::get(metrics::encode_metrics).with_state(registry),
    );

    router.layer(tower_http::trace::TraceLayer::new_for_http())
}

pub async fn listen(
    config: UiServerConfig,
    controller: Arc<Controller>,
    #[cfg(feature = "metrics")] registry: Arc<prometheus_client::registry::Registry>,
) -> Result<(), TracedError<io::Error>> {
    let router = router(
        controller,
        #[cfg(feature = "metrics")]
        registry,
    );

    let socket = TcpListener::bind(config.listen_address)
        .await
        .map_err(InstrumentError::in_current_span)?;

    info!(listen_address = %config.listen_address, "UI running");
    axum::serve(socket, router)
        .await
        .map_err(InstrumentError::in_current_span)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: ControllerStatus,
    listen_address: Option<SocketAddr>,
    destination: Destination,
    open_connections: usize,
}

async fn status(State(controller): State<Arc<Controller>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: controller.status(),
        listen_address: controller.local_addr(),
        destination: controller.destination().clone(),
        open_connections: controller.open_connections().len(),
    })
}

async fn connections(State(controller): State<Arc<Controller>>) -> Json<Vec<SessionSnapshot>> {
    Json(
        controller
            .open_connections()
            .iter()
            .map(|session| session.snapshot())
            .collect(),
    )
}

#[cfg(feature = "metrics")]
mod metrics {
    use std::sync::Arc;

    use axum::{
        extract::State,
        http::{header, HeaderValue, StatusCode},
    };
    use prometheus_client::registry::Registry;

    pub async fn encode_metrics(
        State(registry): State<Arc<Registry>>,
    ) -> Result<([(header::HeaderName, HeaderValue); 1], String), (StatusCode, String)> {
        let mut output = String::new();

        match prometheus_client::encoding::text::encode(&mut output, &registry) {
            Ok(()) => Ok((
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                )],
                output,
            )),
            Err(error) => Err((StatusCode::INTERNAL_SERVER_ERROR, error.to_string())),
        }
    }
}
