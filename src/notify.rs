//! Driver notification delivery.
//!
//! The outbox worker hands each "route assigned" event to a
//! [`DriverNotifier`]. A webhook notifier posts JSON to a configured URL;
//! without one, events are only logged.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Notifications;

/// Payload sent when a route lands with a driver.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteAssignedNotice {
    pub event: &'static str,
    pub route_id: String,
    pub driver_id: String,
    pub driver_name: String,
    pub driver_email: Option<String>,
    pub driver_phone: Option<String>,
    pub start_time: DateTime<Utc>,
    pub total_drops: i64,
    pub estimated_duration_min: i64,
    pub distance_km: f64,
    pub message: String,
}

#[async_trait]
pub trait DriverNotifier: Send + Sync {
    async fn route_assigned(&self, notice: &RouteAssignedNotice) -> Result<()>;
}

/// Logs notices instead of delivering them.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl DriverNotifier for LogNotifier {
    async fn route_assigned(&self, notice: &RouteAssignedNotice) -> Result<()> {
        info!(
            route_id = %notice.route_id,
            driver_id = %notice.driver_id,
            drops = notice.total_drops,
            "route assigned notification (no webhook configured)"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
    url: Url,
    secret: Option<String>,
}

impl fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookNotifier {
    pub fn new(url: &str, secret: Option<String>) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid webhook url {}", url))?;
        let http = Client::builder()
            .user_agent("speedy-routing/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, url, secret })
    }

    pub fn build_request(&self, notice: &RouteAssignedNotice) -> Result<reqwest::Request> {
        let mut req = self
            .http
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .json(notice);
        if let Some(secret) = &self.secret {
            req = req.header("Authorization", format!("Bearer {}", secret));
        }
        req.build().context("failed to build webhook request")
    }
}

#[async_trait]
impl DriverNotifier for WebhookNotifier {
    async fn route_assigned(&self, notice: &RouteAssignedNotice) -> Result<()> {
        let request = self.build_request(notice)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach notification webhook")?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(route_id = %notice.route_id, "notification webhook rate limited");
            return Err(anyhow!("received 429 from notification webhook"));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("notification webhook error {}: {}", status, body));
        }
        info!(route_id = %notice.route_id, driver_id = %notice.driver_id, "driver notified");
        Ok(())
    }
}

/// Webhook notifier when a URL is configured, log notifier otherwise.
pub fn from_config(cfg: &Notifications) -> Result<Arc<dyn DriverNotifier>> {
    match &cfg.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(url, cfg.webhook_secret.clone())?)),
        None => Ok(Arc::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> RouteAssignedNotice {
        RouteAssignedNotice {
            event: "route_assigned",
            route_id: "rt_1".into(),
            driver_id: "drv_1".into(),
            driver_name: "Sam".into(),
            driver_email: None,
            driver_phone: Some("+447700900000".into()),
            start_time: Utc::now(),
            total_drops: 3,
            estimated_duration_min: 225,
            distance_km: 18.5,
            message: "New route assigned: 3 stops".into(),
        }
    }

    #[test]
    fn webhook_request_shape() {
        let notifier =
            WebhookNotifier::new("https://hooks.example.com/drivers", Some("s3cret".into())).unwrap();
        let req = notifier.build_request(&notice()).unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "https://hooks.example.com/drivers");
        assert_eq!(
            req.headers().get("Authorization").unwrap().to_str().unwrap(),
            "Bearer s3cret"
        );
        let body = req.body().and_then(|b| b.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["route_id"], "rt_1");
        assert_eq!(json["total_drops"], 3);
    }

    #[test]
    fn rejects_bad_url() {
        assert!(WebhookNotifier::new("not a url", None).is_err());
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        LogNotifier.route_assigned(&notice()).await.unwrap();
        let cfg = Notifications::default();
        from_config(&cfg).unwrap().route_assigned(&notice()).await.unwrap();
    }
}
