//! Periodic self-ping so free-tier hosts don't idle the service out.

use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Ping `{base_url}/health` every `interval` until `cancel` fires.
///
/// Failures are logged and never stop the loop.
pub fn spawn(base_url: &str, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    tokio::spawn(async move {
        let http = match reqwest::Client::builder().timeout(PING_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "keep-alive disabled: failed to build http client");
                return;
            }
        };

        tracing::info!(%url, every_secs = interval.as_secs(), "keep-alive enabled");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = ticker.tick() => {
                match http.get(&url).send().await {
                  Ok(resp) => tracing::info!(status = resp.status().as_u16(), "keep-alive ping"),
                  Err(e) => tracing::warn!(error = %e, "keep-alive ping failed"),
                }
              }
            }
        }
        tracing::debug!("keep-alive stopped");
    })
}
