mod config;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::AppStateInner;
use parley_chat::{Coordinator, MessageStore};
use parley_crypto::TextCipher;
use parley_crypto::keys::{generate_key, key_from_base64};
use parley_db::Database;
use parley_gateway::Dispatcher;
use parley_translate::{
    FamilyRoute, GatewayConfig, MainstreamLanguages, OpenAiProvider, TranslationGateway,
};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = Arc::new(Database::open(&config.db_path)?);

    let key = match &config.at_rest_key {
        Some(encoded) => key_from_base64(encoded)?,
        None => {
            warn!("PARLEY_AT_REST_KEY not set, generated an ephemeral key. Stored text will be unreadable after restart");
            generate_key()
        }
    };

    let mainstream = match MainstreamLanguages::load(&config.mainstream_languages_path) {
        Ok(languages) => {
            info!(count = languages.len(), "Loaded mainstream languages");
            languages
        }
        Err(e) => {
            warn!(
                path = %config.mainstream_languages_path.display(),
                error = %e,
                "Could not load mainstream languages, every key takes the stylish path"
            );
            MainstreamLanguages::default()
        }
    };

    let gateway = build_gateway(&config, mainstream);
    let store = MessageStore::new(db, TextCipher::new(&key), config.pricing, config.lock_timeout);
    let coordinator = Coordinator::new(store, Arc::new(gateway), Dispatcher::new());

    let app = parley_api::router(Arc::new(AppStateInner { coordinator }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Parley server stopped");
    Ok(())
}

fn build_gateway(config: &ServerConfig, mainstream: MainstreamLanguages) -> TranslationGateway {
    let provider = Arc::new(
        OpenAiProvider::new(&config.openai_api_key)
            .with_base_url(&config.openai_base_url)
            .with_transcribe_model(&config.transcribe_model),
    );

    let mut gateway = TranslationGateway::new(
        provider.clone(),
        mainstream,
        GatewayConfig {
            mainstream_model: config.mainstream_model.clone(),
            full_model: config.full_model.clone(),
            reduced_model: config.reduced_model.clone(),
            vision_model: config.vision_model.clone(),
            timeout: config.translate_timeout,
            ..GatewayConfig::default()
        },
    )
    .with_speech(provider.clone())
    .with_vision(provider);

    if let Some(family) = &config.family {
        let api_key = family.api_key.as_deref().unwrap_or(config.openai_api_key.as_str());
        let base_url = family.base_url.as_deref().unwrap_or(config.openai_base_url.as_str());
        info!(languages = ?family.languages, model = %family.model, base_url, "Language family route enabled");

        gateway = gateway.with_family(FamilyRoute {
            languages: family.languages.iter().cloned().collect::<HashSet<_>>(),
            provider: Arc::new(OpenAiProvider::new(api_key).with_base_url(base_url)),
            model: family.model.clone(),
        });
    }

    gateway
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
