use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use sandrun::config::{CliArgs, Config};
use sandrun::engine::Engine;
use sandrun::routes::ResponseShape;
use sandrun::sandbox::SandboxPrefix;
use sandrun::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        engine: engine_config,
        toolchains,
    } = cli.to_config().context("Failed to load configuration")?;

    let prefix = SandboxPrefix::detect(engine_config.sandbox_prefix_enabled);
    let shape = ResponseShape {
        legacy_compile_error: engine_config.legacy_compile_error_shape,
    };
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let (engine, mut workers) =
        Engine::start(&engine_config, toolchains, prefix, shutdown_token.clone())
            .context("Failed to start the execution engine")?;
    let engine = actix_web::web::Data::new(engine);

    let server = build_server(server_config, engine.clone(), shape)
        .context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting requests, let in-flight ones finish
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {:?}", e);
            } else {
                log::error!("Worker handle finished with error: {:?}", e);
            }
        }
    }

    // 4. Jobs nobody picked up still own workspaces
    let dropped = engine.queue().clear();
    if dropped > 0 {
        log::warn!("Dropped {dropped} queued jobs at shutdown");
    }

    log::info!("Shutdown complete");
    Ok(())
}
