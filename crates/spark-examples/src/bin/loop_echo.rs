//! 回显示例：在事件循环上监听，由 Tokio 多线程运行时上的任务消费并回显连接。
//!
//! # 使用方法
//! ```bash
//! cargo run --bin loop_echo -- echo.toml
//! RUST_LOG=debug cargo run --bin loop_echo
//! ```
//! - 省略配置文件时监听 `127.0.0.1:7878`；
//! - `Ctrl-C` 后停止接纳，已排队的连接仍会被回显完毕。

use anyhow::Context;
use spark_examples::EchoConfig;
use spark_transport_loop::{
    Cancellation, LoopConnection, LoopListener, LoopThread, TransportContext, TransportError,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => EchoConfig::load(path)?,
        None => EchoConfig::fallback(),
    };
    let endpoint = config.listen.to_endpoint()?;

    let thread = LoopThread::start("spark-loop-echo").context("failed to start event loop")?;
    let listener = LoopListener::bind(TransportContext::new(config.transport), thread.clone(), endpoint)
        .context("failed to bind listener")?;
    if let Some(endpoint) = listener.endpoint() {
        tracing::info!(%endpoint, "echo server ready");
    }

    let shutdown = Cancellation::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    serve(&listener, &shutdown).await?;

    listener.stop().await;
    // 停止后继续排空队列，已接纳的连接不被丢弃。
    serve(&listener, &Cancellation::new()).await?;

    tokio::task::spawn_blocking(move || thread.stop())
        .await
        .context("event loop shutdown panicked")?;
    Ok(())
}

async fn serve(listener: &LoopListener, shutdown: &Cancellation) -> anyhow::Result<()> {
    loop {
        match listener.accept(shutdown).await {
            Ok(Some(connection)) => {
                tokio::spawn(echo(connection));
            }
            Ok(None) | Err(TransportError::Cancelled) => return Ok(()),
            Err(err) => return Err(err).context("accept failed"),
        }
    }
}

async fn echo(connection: LoopConnection) {
    let id = connection.id();
    let remote = connection.remote_addr();
    let (mut reader, mut writer) = tokio::io::split(connection);
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => tracing::debug!(connection_id = %id, ?remote, bytes, "echo finished"),
        Err(err) => tracing::warn!(connection_id = %id, ?remote, error = %err, "echo failed"),
    }
}
