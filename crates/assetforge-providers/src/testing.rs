//! Throwaway HTTP backends for adapter tests.

use assetforge_core::generation::{AssetFormat, AssetType, GenerationRequest, QualityLevel};
use axum::Router;
use tokio::net::TcpListener;
use url::Url;

/// Serve `app` on an ephemeral local port and return its base URL.
pub(crate) async fn serve(app: Router) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}", addr)).unwrap()
}

pub(crate) fn knight() -> GenerationRequest {
    GenerationRequest {
        prompt: "knight".to_string(),
        negative_prompt: None,
        asset_type: AssetType::CharacterDesign,
        style: None,
        quality: QualityLevel::Standard,
        format: AssetFormat::Png,
        width: 512,
        height: 512,
        count: 1,
        steps: None,
        guidance_scale: None,
        seed: None,
    }
}
