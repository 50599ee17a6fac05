use std::sync::Arc;

use tracing::warn;

use zapdesk::config::AppConfig;
use zapdesk::gateway::{Gateway, HttpGateway};
use zapdesk::llm::create_models;
use zapdesk::pipeline::PipelineCoordinator;
use zapdesk::server;
use zapdesk::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; optional rolling file log when a log dir is set
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _file_guard = match std::env::var("ZAPDESK_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "zapdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = AppConfig::from_env()?;

    eprintln!("zapdesk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://{}/webhook", config.bind_addr);
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Gateway: {}", config.gateway.base_url);
    eprintln!(
        "   Models: {} / {}",
        config.llm.chat_model, config.llm.embed_model
    );

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&config.db_path)).await?,
    );

    // Surface bad rule configs now instead of per-event
    let invalid_rules = store.validate_rules().await?;
    if invalid_rules.is_empty() {
        eprintln!("   Rules: all configs valid");
    } else {
        for (id, reason) in &invalid_rules {
            warn!(rule_id = %id, reason = %reason, "Invalid automation rule config");
        }
        anyhow::bail!(
            "{} automation rule(s) have invalid configs; fix them before starting",
            invalid_rules.len()
        );
    }

    // ── External capabilities ───────────────────────────────────────
    let (completion, embedding) = create_models(&config.llm)?;
    let gateway: Arc<dyn Gateway> = Arc::new(HttpGateway::new(&config.gateway)?);

    // ── Pipeline ────────────────────────────────────────────────────
    let coordinator = Arc::new(PipelineCoordinator::new(
        store,
        completion,
        embedding,
        gateway,
        config.rag.clone(),
        &config.llm,
        config.skew_tolerance_secs,
    ));

    let router = server::webhook_routes(coordinator, config.webhook_secret.clone());
    server::serve(router, &config.bind_addr).await?;

    Ok(())
}
