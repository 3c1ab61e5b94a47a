//! HTTP surface: the archive, vector tile and point lookup endpoints.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::archive_server::{ArchiveHttpServer, ArchiveResponse};
use crate::context::{ContextParams, ContextResponse, FeatureContextServer};
use crate::layer::LayerCatalog;
use crate::tile_server::VectorTileServer;
use crate::{Error, TileCoord};

pub const TILE_CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Clone)]
pub struct AppState {
    catalog: Arc<dyn LayerCatalog>,
    tiles: VectorTileServer,
    archives: Arc<ArchiveHttpServer>,
    context: FeatureContextServer,
}

impl AppState {
    pub fn new(
        catalog: Arc<dyn LayerCatalog>,
        tiles: VectorTileServer,
        archives: ArchiveHttpServer,
        context: FeatureContextServer,
    ) -> Self {
        AppState {
            catalog,
            tiles,
            archives: Arc::new(archives),
            context,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/serve-pmtile/{layer_uuid}/", get(serve_archive))
        .route("/{identifier}/tile/{z}/{x}/{y}/", get(serve_tile))
        .route("/api/context/", get(lookup_features))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, app: Router) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "unable to listen for shutdown signal");
        return;
    }
    info!("shutting down");
}

async fn serve_archive(
    State(state): State<AppState>,
    Path(layer_uuid): Path<String>,
    headers: HeaderMap,
) -> Result<ArchiveResponse, Error> {
    let id = Uuid::parse_str(&layer_uuid).map_err(|_| Error::NotFound)?;
    let layer = state.catalog.layer(&id).await?;
    let range = headers
        .get(header::RANGE)
        .map(|value| value.as_bytes().to_vec());

    let archives = state.archives.clone();
    tokio::task::spawn_blocking(move || archives.serve_raw(layer.as_ref(), range.as_deref()))
        .await
        .map_err(io::Error::other)?
}

async fn serve_tile(
    State(state): State<AppState>,
    Path((identifier, z, x, y)): Path<(String, String, String, String)>,
) -> Result<Response, Error> {
    let tile = match (z.parse(), x.parse(), y.parse()) {
        (Ok(z), Ok(x), Ok(y)) => TileCoord::new(z, x, y),
        _ => return Err(Error::NotFound),
    };
    let raw_tile = state.tiles.serve(&identifier, tile).await?;
    Ok(([(header::CONTENT_TYPE, TILE_CONTENT_TYPE)], raw_tile).into_response())
}

async fn lookup_features(
    State(state): State<AppState>,
    Query(params): Query<ContextParams>,
) -> Result<Json<ContextResponse>, Error> {
    Ok(Json(state.context.serve(&params).await?))
}

impl IntoResponse for ArchiveResponse {
    fn into_response(self) -> Response {
        let headers = self.headers();
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        for (name, value) in headers {
            if let Ok(value) = HeaderValue::try_from(value) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound => StatusCode::NOT_FOUND,
            err if err.is_client_error() => {
                debug!(%err, "rejected request");
                StatusCode::BAD_REQUEST
            }
            err => {
                error!(%err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        status.into_response()
    }
}
