mod command;
mod config;
mod discovery;
mod engine;
mod error;
mod janitor;
mod process;
mod relay;
mod state;
mod store;
mod stream;
mod supervisor;
mod web;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use clap::Parser;
use config::AppConfig;
use state::AppState;
use std::path::Path;
use std::sync::Arc;
use store::ConfigStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stream Panel - MJPEG / RTSP camera streaming control
/// 解析命令行参数，加载配置，启动HTTP服务及后台任务
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "stream-panel.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，默认 info 级别，可用 RUST_LOG 覆盖
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stream_panel=info")),
        )
        .init();

    let args = Args::parse();

    // 配置文件不存在时使用默认值
    let config = if Path::new(&args.config).exists() {
        AppConfig::load(&args.config)?
    } else {
        warn!("Config file {} not found, using defaults", args.config);
        AppConfig::default()
    };

    let store = ConfigStore::open(&config.server.store_path)?;
    info!(
        "Stream Panel initialized. Store: {}, videos: {}",
        config.server.store_path.display(),
        config.server.video_dir.display()
    );

    let state = Arc::new(AppState::new(config.clone(), store));
    let cancel = CancellationToken::new();

    // 启动后台看门狗和开机自启
    let watchdog = tokio::spawn(supervisor::start_watchdog(
        state.clone(),
        config.server.watchdog_interval_ms,
        cancel.clone(),
    ));
    let autostart = tokio::spawn(supervisor::autostart(
        state.clone(),
        config.server.autostart_delay_sec,
        cancel.clone(),
    ));

    // 注册HTTP路由
    let app = Router::new()
        .route("/", get(web::admin::index_handler)) // 控制页面
        .route("/api/status", get(web::admin::status)) // 总状态
        .route("/api/config", get(web::admin::get_config)) // 已保存配置
        .route("/api/sys", get(web::admin::sys_status)) // 系统状态
        .route("/api/videos/list", get(web::videos::list_videos))
        .route("/api/videos/delete", post(web::videos::delete_video))
        .route(
            "/api/videos/upload",
            post(web::videos::upload_video)
                .layer(DefaultBodyLimit::max(config.server.max_upload_mb * 1024 * 1024)),
        )
        .route("/api/:kind/status", get(web::streams::handle_status))
        .route("/api/:kind/start", post(web::streams::handle_start))
        .route("/api/:kind/stop", post(web::streams::handle_stop))
        .route("/api/:kind/save", post(web::streams::handle_save))
        .with_state(state.clone());

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // 收尾：停止后台任务和所有流
    cancel.cancel();
    let _ = watchdog.await;
    let _ = autostart.await;
    for report in [state.mjpg.stop().await, state.rtsp.stop().await] {
        for w in report.warnings {
            warn!("Shutdown: {}", w);
        }
    }
    info!("Stream Panel stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        _ = cancel.cancelled() => {}
    }
}
