//! Tether demo
//!
//! Starts a local echo server, sends requests through a pooled, retried TCP client,
//! then stops the server and shows the retryer giving up.
//!
//! Pass a TOML/YAML/JSON file as the first argument to override the defaults.

use std::time::Duration;

use anyhow::Context as _;
use tether::{
    Connection, ConnectionManager, ConnectionPool, Context, ManagerFactory, RetryError, Retryer,
    TetherConfig,
};
use tether_tcp::TcpDialer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

async fn start_echo_server() -> anyhow::Result<(String, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    Ok((addr, handle))
}

type Pool = ConnectionPool<ManagerFactory<TcpDialer>>;

/// One request/response exchange over a pooled connection.
async fn echo(pool: &Pool, ctx: &Context, message: &str) -> Result<String, tether::Error> {
    let conn = pool.get(ctx).await?;
    let payload = message.as_bytes().to_vec();

    let reply = conn
        .with_stream(|stream| {
            Box::pin(async move {
                stream.write_all(&payload).await?;
                let mut buf = vec![0u8; payload.len()];
                stream.read_exact(&mut buf).await?;
                Ok::<_, std::io::Error>(buf)
            })
        })
        .await
        .map_err(|source| tether::Error::connection(conn.address(), source))?;

    Ok(String::from_utf8_lossy(&reply).into_owned())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => TetherConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        None => TetherConfig::default(),
    };
    config.logging.init()?;

    let (addr, server) = start_echo_server().await?;
    info!(address = %addr, "Echo server listening");

    let manager = ConnectionManager::new(TcpDialer::new(), config.manager.clone());
    let pool = ConnectionPool::new(ManagerFactory::new(manager.clone(), &addr), config.pool)?;
    let retryer = Retryer::new(config.retry.clone());

    for i in 0..5 {
        let ctx = Context::with_timeout(Duration::from_secs(2));
        let message = format!("ping {i}");
        let reply = retryer
            .retry_with_context(&ctx, |ctx| {
                let pool = pool.clone();
                let message = message.clone();
                async move { echo(&pool, &ctx, &message).await }
            })
            .await?;
        info!(reply = %reply, "Received echo");
    }

    info!(pool = ?pool.stats(), manager = ?manager.stats().await, "Healthy phase done");

    server.abort();
    let _ = server.await;
    // Break the cached connection so the next request has to dial again
    manager.remove(&addr).await?;

    let ctx = Context::with_timeout(Duration::from_secs(5));
    match retryer
        .retry_with_context(&ctx, |ctx| {
            let pool = pool.clone();
            async move { echo(&pool, &ctx, "ping after shutdown").await }
        })
        .await
    {
        Ok(reply) => warn!(reply = %reply, "Server answered after shutdown"),
        Err(RetryError::Exhausted { attempts, last }) => {
            info!(attempts, error = %last, "Gave up after retries");
        }
        Err(err) => warn!(error = %err, "Request failed"),
    }

    info!(retry = ?retryer.stats(), "Retry statistics");
    pool.close().await?;
    Ok(())
}
