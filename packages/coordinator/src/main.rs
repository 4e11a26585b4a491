//! Cross-chain transfer coordinator node
//!
//! Accepts transfer requests over HTTP and drives each one through
//! lock, MPC signing, release and (when needed) refund. State lives in
//! Postgres; a restarted node resumes every non-terminal transfer.

use std::net::SocketAddr;
use std::sync::Arc;

use coordinator::api;
use coordinator::chain::{ChainRegistry, EvmAdapter, NearAdapter};
use coordinator::codec::PayloadCodec;
use coordinator::config::Config;
use coordinator::ledger::{postgres, PgLedger};
use coordinator::signer::NearMpcSigner;
use coordinator::TransferCoordinator;
use eyre::WrapErr;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting transfer coordinator");

    let config = Config::load()?;
    tracing::info!(
        evm_chain = %config.evm.name,
        evm_chain_id = config.evm.chain_id,
        near_chain = %config.near.name,
        mpc_contract = %config.mpc.contract_id,
        "Configuration loaded"
    );

    let db = postgres::create_pool(&config.database.url).await?;
    tracing::info!("Database connected");

    postgres::run_migrations(&db).await?;
    tracing::info!("Database migrations complete");

    let chains = ChainRegistry::new()
        .with(Arc::new(
            EvmAdapter::new(&config.evm).wrap_err("Failed to initialize EVM adapter")?,
        ))
        .with(Arc::new(
            NearAdapter::new(&config.near).wrap_err("Failed to initialize NEAR adapter")?,
        ));

    let signer = NearMpcSigner::new(
        &config.mpc,
        &config.near.relayer_url,
        &config.near.signer_account,
    )
    .wrap_err("Failed to initialize MPC signer")?;

    let codec = PayloadCodec::new(config.codec.key_ring()?);

    let coordinator = Arc::new(
        TransferCoordinator::new(
            Arc::new(PgLedger::new(db)),
            chains,
            Arc::new(signer),
            codec,
            config.coordinator_settings(),
        )
        .wrap_err("Failed to initialize coordinator")?,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    let api_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_coordinator).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    if let Err(e) = coordinator.run(shutdown_rx).await {
        tracing::error!(error = %e, "Coordinator error");
    }

    tracing::info!("Transfer coordinator stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,coordinator=debug,bridge_coordinator=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
