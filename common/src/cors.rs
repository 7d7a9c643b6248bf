use tower_http::cors::CorsLayer;

/// Permissive CORS for browser clients served from another origin.
pub fn dev() -> CorsLayer {
    CorsLayer::permissive()
}
