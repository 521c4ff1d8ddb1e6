use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use yuanjing_forensics::api;
use yuanjing_forensics::batch::SledCheckpointStore;
use yuanjing_forensics::config::Config;
use yuanjing_forensics::signer::ReportSigner;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    // ----------------------------------------------------------------
    // 0. 加载配置与策略
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    let policy = config.load_policy()?;
    info!(
        host = %config.host,
        port = config.port,
        db = %config.db_path,
        key = %config.key_path,
        policy_version = %policy.version,
        "configuration loaded"
    );

    // ----------------------------------------------------------------
    // 1. 身份加载 & 检查点存储
    // ----------------------------------------------------------------
    let signer = ReportSigner::load_or_generate(&config.key_path)?;
    info!(public_key = %signer.public_key_hex(), "report signer ready");

    let checkpoints = SledCheckpointStore::open(&config.db_path)
        .with_context(|| format!("opening checkpoint store at {}", config.db_path))?;

    // ----------------------------------------------------------------
    // 2. 状态共享容器
    // ----------------------------------------------------------------
    let shared_state = Arc::new(api::AppState {
        policy,
        signer,
        checkpoints: Arc::new(checkpoints),
    });

    // ----------------------------------------------------------------
    // 3. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(shared_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "forensics API listening");

    axum::serve(listener, app).await?;

    Ok(())
}
