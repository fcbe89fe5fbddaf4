//! Simple pooling example
//!
//! A pool of fake connections: warm-up, borrow, release, a leak report and
//! shutdown. Run with `RUST_LOG=sluice=debug` to see the pool's own logs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sluice::{Context, Factory, Pool, PoolConfig, PoolEvent, validator_fn};
use tracing_subscriber::EnvFilter;

/// Example connection.
#[derive(Debug)]
struct Connection {
    id: u32,
    host: String,
    healthy: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("cannot reach {0}")]
struct ConnectError(String);

/// Opens connections to one host.
struct ConnectionFactory {
    host: String,
    next_id: AtomicU32,
}

impl Factory for ConnectionFactory {
    type Raw = Connection;
    type Error = ConnectError;

    async fn create(&self) -> Result<Connection, ConnectError> {
        // Simulate connection setup
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.host.is_empty() {
            return Err(ConnectError(self.host.clone()));
        }
        Ok(Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            host: self.host.clone(),
            healthy: true,
        })
    }

    async fn close(&self, conn: Connection) -> Result<(), ConnectError> {
        tracing::info!(id = conn.id, host = %conn.host, "Closing connection");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = PoolConfig {
        core_size: 2,
        max_size: 4,
        max_wait: Duration::from_secs(1),
        leak_threshold: Duration::from_millis(200),
        leak_scan_interval: Duration::from_millis(100),
        ..PoolConfig::named("example-db")
    };
    let factory = ConnectionFactory {
        host: "localhost".to_string(),
        next_id: AtomicU32::new(1),
    };
    let pool = Pool::start(config, factory, validator_fn(|c: &Connection| c.healthy)).await?;

    let mut events = pool.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let PoolEvent::LeakDetected { handle_id, held_for, site, .. } = event {
                let site = site.map_or_else(|| "unknown".to_string(), |s| s.to_string());
                println!("leak: handle {handle_id} held {held_for:?}, borrowed at {site}");
            }
        }
    });

    println!("after warm-up: {:?}", pool.stats());

    // Borrow, use and return
    let ctx = Context::new().with_label("request-1");
    let mut conn = pool.borrow(&ctx).await?;
    println!("borrowed connection {} to {}", conn.id, conn.host);
    conn.close().await?;

    // A connection marked unhealthy is replaced on release
    let mut conn = pool.borrow(&ctx).await?;
    conn.healthy = false;
    conn.close().await?;
    println!("after replacement: {:?}", pool.stats());

    // Hold one past the leak threshold
    let held = pool.borrow(&Context::new().with_label("slow-job")).await?;
    tokio::time::sleep(Duration::from_millis(350)).await;
    drop(held);

    pool.shutdown(&Context::new().with_timeout(Duration::from_secs(2))).await?;
    println!("after shutdown: {:?}", pool.stats());
    Ok(())
}
