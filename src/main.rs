//! agent-relay 命令行入口
//!
//! 逐行读取 stdin 作为消息，经 Router 发送并把流式分片写到 stdout。
//! 命令：`/stats` 查看统计，`/reset` 重置当前用户的 Router，`/quit` 退出。
//!
//! 用法：`agent-relay [user_id] [config.toml]`

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_relay::config::load_config;
use agent_relay::core::{RouterSettings, SessionRegistry};
use agent_relay::credentials::CredentialStore;
use agent_relay::observability;
use agent_relay::streaming::StreamHandlers;
use agent_relay::transport::{DefaultTransportFactory, TransportFactory};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const HELP: &str = "Type a message and press Enter. Commands: /stats, /reset, /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let user_id = args.next().unwrap_or_else(|| "local".to_string());
    let config_path = args.next().map(PathBuf::from);

    let config = Arc::new(load_config(config_path).context("Failed to load configuration")?);
    let store = CredentialStore::open(
        &config.credentials.path,
        config.credentials.secret.as_deref(),
    )
    .context("Failed to open credential store")?;

    let factory: Arc<dyn TransportFactory> =
        Arc::new(DefaultTransportFactory::new(Arc::clone(&config)));
    let registry = Arc::new(SessionRegistry::new(
        RouterSettings::from_config(&config),
        Arc::new(store),
        factory,
        Duration::from_secs(config.registry.idle_timeout_secs),
    ));

    let cancel = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(
        Duration::from_secs(config.registry.sweep_interval_secs.max(1)),
        cancel.clone(),
    );

    tracing::info!(user_id = %user_id, "agent-relay ready");
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/stats" => match registry.stats(&user_id).await {
                Some(stats) => println!("{stats}"),
                None => println!("no messages sent yet"),
            },
            "/reset" => {
                registry.reset(&user_id).await;
                println!("router reset");
            }
            text => {
                let streamed = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&streamed);
                let handlers = StreamHandlers::new().on_update(move |chunk| {
                    flag.store(true, Ordering::Relaxed);
                    print!("{chunk}");
                    let _ = std::io::stdout().flush();
                });

                match registry.send(&user_id, text, handlers).await {
                    Ok(_) if streamed.load(Ordering::Relaxed) => println!(),
                    Ok(reply) => println!("{reply}"),
                    Err(e) => eprintln!("error: {e}"),
                }
            }
        }
    }

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Sweeper task failed");
    }
    registry.shutdown().await;
    Ok(())
}
