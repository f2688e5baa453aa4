//! Statistics fan-out.
//!
//! Indexing progress lines go here as well as to the normal log; HTTP /stats
//! clients subscribe and receive each line as a server-sent event. Lagging
//! subscribers lose lines rather than applying backpressure.

use tokio::sync::broadcast;
use tracing::info;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct StatsBus {
  tx: broadcast::Sender<String>,
}

impl Default for StatsBus {
  fn default() -> Self {
    Self::new()
  }
}

impl StatsBus {
  pub fn new() -> StatsBus {
    let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
    StatsBus { tx }
  }

  pub fn publish(&self, line: impl Into<String>) {
    let line = line.into();
    info!(target: "cintel::stats", "{}", line);
    let _ = self.tx.send(line);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<String> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_publish_reaches_subscribers() {
    let bus = StatsBus::new();
    let mut rx = bus.subscribe();
    bus.publish("[ 50%] 1/2 a.c 12 symbols");
    assert_eq!(rx.recv().await.unwrap(), "[ 50%] 1/2 a.c 12 symbols");
  }

  #[test]
  fn test_publish_without_subscribers_is_fine() {
    StatsBus::new().publish("nobody listening");
  }
}
