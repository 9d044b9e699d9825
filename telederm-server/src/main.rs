//! 问诊平台预约核心服务主程序
//!
//! 组合根：加载配置、初始化日志、选择存储与支付网关实现、装配
//! workflow/reporting服务、启动过期支付清扫器与HTTP服务器。

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use telederm_admin::TeledermConfig;
use telederm_database::{CoreStore, DatabasePool, MemoryStore, PostgresStore};
use telederm_integration::{
    CheckoutClient, CoreEvent, EventEmitter, MockGateway, PaymentGateway, WebhookManager,
};
use telederm_reporting::{ListingService, StatisticsService};
use telederm_web::{AppState, AuthService, WebServer};
use telederm_workflow::{
    BookingService, CancellationService, MedicalRecordService, PaymentSweeper, SettlementService,
    SlotService,
};
use tracing::info;

/// 预约核心服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "telederm-server")]
#[command(about = "远程皮肤科问诊平台的预约与排班核心服务")]
struct Args {
    /// 监听端口（覆盖配置文件）
    #[arg(short, long)]
    port: Option<u16>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别（覆盖配置文件）
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TeledermConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let log_level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    telederm_admin::logging::init(log_level)?;

    info!("Starting TeleDerm appointment core");
    info!("  listen: {}:{}", config.server.host, config.server.port);
    info!("  store: {}", if config.database.in_memory { "memory" } else { "postgres" });
    info!("  payment provider: {}", config.payment.provider);

    let store = build_store(&config).await?;
    let gateway = build_gateway(&config);
    let emitter = build_emitter(&config).await;
    let policy = config.core.policy();

    let settlement = Arc::new(SettlementService::new(store.clone(), emitter.clone()));
    let state = AppState {
        store: store.clone(),
        slots: Arc::new(SlotService::new(store.clone(), policy)),
        booking: Arc::new(BookingService::new(
            store.clone(),
            gateway,
            emitter.clone(),
            policy,
        )),
        cancellation: Arc::new(CancellationService::new(store.clone(), emitter.clone(), policy)),
        settlement: settlement.clone(),
        records: Arc::new(MedicalRecordService::new(store.clone())),
        listing: Arc::new(ListingService::new(store.clone())),
        statistics: Arc::new(StatisticsService::new(store.clone())),
    };
    let auth = Arc::new(AuthService::new(
        config.server.session_issue_secret.clone(),
        config.server.session_ttl_hours * 3600,
    ));

    let sweeper = PaymentSweeper::new(store, settlement, config.core.sweep_interval_seconds);
    sweeper.spawn();
    info!("Payment sweeper started (interval {}s)", config.core.sweep_interval_seconds);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    WebServer::new(addr, state, auth).run().await?;
    Ok(())
}

async fn build_store(config: &TeledermConfig) -> Result<Arc<dyn CoreStore>> {
    if config.database.in_memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let pool = DatabasePool::connect(&config.database.url, config.database.max_connections).await?;
    let store = PostgresStore::new(pool);
    store.migrate().await?;
    Ok(Arc::new(store))
}

fn build_gateway(config: &TeledermConfig) -> Arc<dyn PaymentGateway> {
    match config.payment.provider.as_str() {
        "checkout" => Arc::new(CheckoutClient::new(
            config.payment.base_url.clone(),
            config.payment.api_key.clone(),
        )),
        // 配置校验保证provider只剩mock
        _ => Arc::new(MockGateway::new()),
    }
}

async fn build_emitter(config: &TeledermConfig) -> Arc<dyn EventEmitter> {
    let manager = WebhookManager::new();
    for subscriber in &config.webhook.subscribers {
        let id = manager
            .subscribe(
                subscriber.url.clone(),
                vec![
                    CoreEvent::AppointmentConfirmed,
                    CoreEvent::AppointmentRejected,
                    CoreEvent::RefundRequested,
                ],
                Some(subscriber.secret.clone()),
            )
            .await;
        info!("Webhook subscriber {} registered ({})", subscriber.url, id);
    }
    Arc::new(manager)
}
