//! RPC server used by the dispatcher

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{GetTestRequest, GetTestResponse, ResultRequest, ResultResponse, GET_TEST_ROUTE, RESULT_ROUTE};

/// Server-side handlers of the RPC surface
pub trait TestService: Send + Sync + 'static {
    fn get_test(&self, req: GetTestRequest) -> impl Future<Output = GetTestResponse> + Send;

    fn result(&self, req: ResultRequest) -> impl Future<Output = ResultResponse> + Send;
}

pub fn router<S: TestService>(service: Arc<S>) -> Router {
    Router::new()
        .route(GET_TEST_ROUTE, post(get_test::<S>))
        .route(RESULT_ROUTE, post(result::<S>))
        .with_state(service)
}

async fn get_test<S: TestService>(
    State(service): State<Arc<S>>,
    Json(req): Json<GetTestRequest>,
) -> Json<GetTestResponse> {
    Json(service.get_test(req).await)
}

async fn result<S: TestService>(
    State(service): State<Arc<S>>,
    Json(req): Json<ResultRequest>,
) -> Json<ResultResponse> {
    Json(service.result(req).await)
}

/// Serve until `shutdown` fires, then let in-flight requests finish
pub async fn serve<S: TestService>(
    listener: TcpListener,
    service: Arc<S>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listen on {}", addr);
    }
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
