//! Router-backed notification outputs

use async_trait::async_trait;
use serde_json::json;
use simselector_engine::router::paths;
use simselector_engine::{NotificationSink, RouterConfigClient, SelectorError};
use std::sync::Arc;
use tracing::info;

type Result<T> = simselector_engine::Result<T>;

/// Log lines go to `tracing`; alerts and the description field go to the router
pub struct RouterNotificationSink {
    router: Arc<dyn RouterConfigClient>,
}

impl RouterNotificationSink {
    /// Sink writing through `router`
    pub fn new(router: Arc<dyn RouterConfigClient>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl NotificationSink for RouterNotificationSink {
    async fn log(&self, message: &str) {
        info!(target: "simselector", "{}", message);
    }

    async fn alert(&self, message: &str) -> Result<()> {
        if !self.router.put(paths::ALERT, json!(message)).await? {
            return Err(SelectorError::Router("alert rejected".into()));
        }
        Ok(())
    }

    async fn set_description(&self, text: &str) -> Result<()> {
        if !self.router.put(paths::DESCRIPTION, json!(text)).await? {
            return Err(SelectorError::Router("description write rejected".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simselector_engine::InMemoryRouter;

    #[tokio::test]
    async fn test_alert_and_description_land_in_the_tree() {
        let router = Arc::new(InMemoryRouter::new());
        let sink = RouterNotificationSink::new(router.clone());

        sink.log("only logged").await;
        tokio_test::assert_ok!(sink.alert("SimSelector: Complete!").await);
        tokio_test::assert_ok!(sink.set_description("03/07/24 14:05:09 | results").await);

        assert_eq!(router.value(paths::ALERT), Some(json!("SimSelector: Complete!")));
        assert_eq!(router.value(paths::DESCRIPTION), Some(json!("03/07/24 14:05:09 | results")));
    }
}
