//! Publish ingress: newline-delimited JSON, one event per line.
//!
//! ```text
//! {"channel":"positions","data":{"id":"P1","status":"OPEN",...}}
//! ```
//!
//! The trading backend pipes its events into the broker process this way.
//! Bad lines are logged and skipped.

use pulse_core::Channel;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::actor::BrokerHandle;

#[derive(Debug, Deserialize)]
struct PublishLine {
    channel: Channel,
    data: Value,
}

/// Publish every valid line from `reader` until EOF.
///
/// Returns the number of events published.
pub async fn run_ingress<R>(reader: R, broker: BrokerHandle) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut published = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: PublishLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                warn!("[ingress] line {line_no}: skipped ({e})");
                continue;
            }
        };
        if parsed.data.is_null() {
            warn!("[ingress] line {line_no}: skipped (null data)");
            continue;
        }
        let seq = broker.publish(parsed.channel, parsed.data).await?;
        debug!("[ingress] line {line_no}: {} seq={seq}", parsed.channel);
        published += 1;
    }

    info!("[ingress] input closed after {published} event(s)");
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn_broker;
    use pulse_core::config::BrokerConfig;

    #[tokio::test]
    async fn publishes_valid_lines_only() {
        let broker = spawn_broker(&BrokerConfig::default());
        let input = concat!(
            "{\"channel\":\"positions\",\"data\":{\"id\":\"P1\"}}\n",
            "\n",
            "garbage\n",
            "{\"channel\":\"heartbeat\",\"data\":{}}\n",
            "{\"channel\":\"risk-alerts\",\"data\":null}\n",
            "{\"channel\":\"risk-alerts\",\"data\":{\"message\":\"x\"}}\n",
        );
        let n = run_ingress(input.as_bytes(), broker.clone()).await.unwrap();
        assert_eq!(n, 2);

        let stats = broker.stats().await.unwrap();
        let buffered: usize = stats.channels.iter().map(|(_, b, _)| *b).sum();
        assert_eq!(buffered, 2);
    }
}
