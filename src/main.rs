use std::sync::Arc;
use std::time::Duration;

use unlimited_proxy::modules;
use unlimited_proxy::proxy;

#[tokio::main]
async fn main() -> Result<(), String> {
    modules::logger::init_logger();

    let mut proxy_config = match modules::config::load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!("failed to load config: {}. using defaults", err);
            let cfg = proxy::ProxyConfig::default();
            let _ = modules::config::save_config(&cfg);
            cfg
        }
    };

    if let Ok(value) = std::env::var("UNLIMITED_ALLOW_LAN") {
        let enabled = matches!(value.as_str(), "1" | "true" | "yes" | "on");
        if enabled {
            proxy_config.allow_lan_access = true;
        }
    }

    if let Ok(value) = std::env::var("UNLIMITED_PORT") {
        match value.parse::<u16>() {
            Ok(port) => proxy_config.port = port,
            Err(_) => tracing::warn!("invalid UNLIMITED_PORT value: {}", value),
        }
    }

    if let Ok(value) = std::env::var("UNLIMITED_KEY_FILE") {
        if !value.is_empty() {
            proxy_config.key_file = value;
        }
    }

    if let Ok(value) = std::env::var("UNLIMITED_TOKEN_STORAGE_TYPE") {
        match value.parse() {
            Ok(kind) => proxy_config.token_storage_type = kind,
            Err(e) => tracing::warn!("{}, keeping configured backend", e),
        }
    }

    let bind_address = if let Ok(addr) = std::env::var("UNLIMITED_BIND") {
        if addr != "127.0.0.1" && addr != "localhost" {
            proxy_config.allow_lan_access = true;
        }
        addr
    } else {
        proxy_config.get_bind_address().to_string()
    };

    let config = Arc::new(proxy_config);

    // API 密钥注册表
    let key_registry = Arc::new(modules::api_keys::KeyRegistry::new(&config.key_file));
    if config.key_protection && key_registry.is_empty() {
        tracing::warn!(
            "API key protection is on but no keys were loaded from {}; all API requests will be rejected",
            config.key_file
        );
    }

    // Token 池: 存储 -> 上游客户端 -> 管理器
    let store = proxy::token_store::open_store(
        config.token_storage_type,
        &config.token_db_path,
        &config.token_storage_dir,
    );
    let upstream = Arc::new(proxy::upstream::UpstreamClient::new(&config));
    let token_manager = Arc::new(proxy::TokenManager::new(
        upstream.clone(),
        store,
        &config,
    ));

    let warmed = token_manager.load_from_store().await;
    if warmed == 0 {
        tracing::info!("token pool starting cold; the first request will acquire a token");
    }
    let _refresh_task =
        token_manager.spawn_refresh_loop(Duration::from_secs(config.refresh_interval_secs));

    let guard = Arc::new(proxy::SecurityGuard::new(
        config.ip_whitelist.clone(),
        config.block_threshold,
        Duration::from_secs(config.block_duration_secs),
    ));
    let ip_limiter = Arc::new(proxy::rate_limit::RateLimiter::new());
    let key_limiter = Arc::new(proxy::rate_limit::RateLimiter::new());

    // Periodic sweep so idle rate-limit subjects and expired bans do not
    // accumulate.
    {
        let guard = guard.clone();
        let ip_limiter = ip_limiter.clone();
        let key_limiter = key_limiter.clone();
        let window = Duration::from_secs(config.time_window_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ip_limiter.cleanup_expired(window);
                key_limiter.cleanup_expired(window);
                guard.cleanup_expired();
            }
        });
    }

    let state = proxy::server::AppState {
        config: config.clone(),
        token_manager: token_manager.clone(),
        key_registry,
        guard,
        ip_limiter,
        key_limiter,
        upstream,
        stats: Arc::new(proxy::server::RequestStats::default()),
    };

    let (server, handle) = proxy::AxumServer::start(bind_address.clone(), config.port, state)
        .await
        .map_err(|e| format!("failed to start proxy server: {}", e))?;

    tracing::info!(
        "unlimited-proxy listening on http://{}:{}",
        bind_address,
        config.port
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {}", e))?;

    tracing::info!("shutdown requested, stopping server...");
    server.stop();
    let _ = handle.await;

    Ok(())
}
