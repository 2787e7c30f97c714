use std::env;
use std::path::PathBuf;

use anyhow::Result;

use plating_studio::{
    backend::{DEFAULT_API_BASE, PlatingBackend},
    cache::StudioStorage,
    handlers::{self, AppState},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let port = env::var("STUDIO_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000);
    let bind_address = format!("0.0.0.0:{}", port);

    let data_dir = resolve_data_dir();
    let cache_base_url = resolve_cache_base_url(&bind_address);
    let api_base = env::var("PLATING_API_BASE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let api_key = env::var("PLATING_API_KEY").unwrap_or_default();
    if api_key.trim().is_empty() {
        eprintln!("[WARN] 未配置 PLATING_API_KEY，上游请求将被拒绝");
    }

    let storage = StudioStorage::new(data_dir.clone(), cache_base_url);
    let backend = PlatingBackend::new(api_base, api_key);
    let state = AppState::new(storage, backend);
    let router = handlers::build_router(state, data_dir);

    let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;
    println!("Plating Studio server started at http://{}", bind_address);

    let _ = axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async { let _ = tokio::signal::ctrl_c().await; })
        .await;
    Ok(())
}

fn resolve_data_dir() -> PathBuf {
    let data_dir = env::var("DATA_DIR")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    if let Some(dir) = data_dir {
        return dir;
    }
    let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push("plating-studio");
    base
}

fn resolve_cache_base_url(bind_address: &str) -> String {
    if let Ok(cache_url) = env::var("CACHE_URL") {
        let trimmed = cache_url.trim();
        if !trimmed.is_empty() {
            return format!("{}/cache", trimmed.trim_end_matches('/'));
        }
    }
    let raw_domain = env::var("DOMAIN")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| bind_address.to_string());
    let trimmed = raw_domain.trim();
    let mut base = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", trimmed.trim_end_matches('/'))
    };
    // DOMAIN 配置偶尔会重复携带协议前缀
    for (doubled, fixed) in [
        ("http://http://", "http://"),
        ("https://https://", "https://"),
        ("http://https://", "https://"),
        ("https://http://", "http://"),
    ] {
        while base.starts_with(doubled) {
            base = base.replacen(doubled, fixed, 1);
        }
    }
    format!("{base}/cache")
}
