use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use rust_embed::Embed;

#[derive(Embed)]
#[folder = "static/"]
pub struct ControlAssets;

/// Serve files from the embedded `ControlAssets`, falling back to the
/// control page for unknown paths.
pub async fn serve_embedded(req: Request) -> Response {
    let path = req.uri().path().trim_start_matches('/');

    let (data, effective_path) = match ControlAssets::get(path) {
        Some(file) => (file, path.to_string()),
        None => match ControlAssets::get("control.html") {
            Some(file) => (file, "control.html".to_string()),
            None => {
                return (StatusCode::NOT_FOUND, "control.html not found in embedded assets")
                    .into_response();
            }
        },
    };

    let mime = mime_guess::from_path(&effective_path)
        .first_or_octet_stream()
        .to_string();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(data.data.into_owned()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
