//! Probe an automation target: open a session, print the current page and
//! the captured console output, then tear down.
//!
//! Configuration comes from `AUTOMATOR_*` environment variables, optionally
//! overridden by a JSON object passed as the first argument:
//!
//! ```text
//! probe '{"wsEndpoint": "ws://127.0.0.1:9420"}'
//! ```

use std::time::Duration;

use anyhow::Context;
use remote_automator_core::ConnectionOverrides;
use remote_automator_launcher::DevtoolsConnector;
use remote_automator_session::SessionManager;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let overrides = match std::env::args().nth(1) {
        Some(raw) => {
            let value = serde_json::from_str(&raw).context("overrides must be a JSON object")?;
            Some(ConnectionOverrides::from_json(value)?)
        }
        None => None,
    };

    let mut manager = SessionManager::new(DevtoolsConnector::new());

    let result = manager
        .run_with_page_context(overrides, |page, _connection, config| async move {
            tracing::info!(mode = %config.mode, path = %page.path, "connected");
            println!("{}", serde_json::to_string_pretty(&page)?);
            // Let console output from the page arrive.
            tokio::time::sleep(Duration::from_millis(500)).await;
            anyhow::Ok(())
        })
        .await;

    for entry in manager.log_entries() {
        println!("[{}] {}", entry.kind, entry.message);
    }

    manager.teardown().await;
    result
}
