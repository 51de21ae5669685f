//! Service Publisher
//!
//! Periodically declares this site's services to every upstream's push
//! listener. Each push is a full `ServiceTableUpdate`, so a lost push is
//! repaired by the next one.

use crate::domain::services::LocalServices;
use crate::domain::{EdgeSite, ServiceTableUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct ServicePublisher {
    site: EdgeSite,
    local: Arc<LocalServices>,
    targets: Vec<String>,
    interval: Duration,
    client: reqwest::Client,
}

impl ServicePublisher {
    pub fn new(
        site: EdgeSite,
        local: Arc<LocalServices>,
        targets: Vec<String>,
        interval: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            site,
            local,
            targets,
            interval,
            client,
        })
    }

    pub fn update(&self) -> ServiceTableUpdate {
        self.local.to_update(self.site)
    }

    /// POST the current declaration to one target.
    pub async fn push(&self, target: &str) -> anyhow::Result<()> {
        let response = self.client.post(target).json(&self.update()).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("push to {} failed: {} - {}", target, status, body);
        }
        Ok(())
    }

    /// Push to every target once; returns how many accepted.
    pub async fn push_all(&self) -> usize {
        let mut accepted = 0;
        for target in &self.targets {
            match self.push(target).await {
                Ok(()) => {
                    accepted += 1;
                    tracing::debug!("pushed {} services to {}", self.local.len(), target);
                }
                Err(e) => tracing::warn!("{}", e),
            }
        }
        accepted
    }

    /// Push every `interval` until shutdown.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.targets.is_empty() {
            tracing::debug!("no push targets, publisher not started");
            return;
        }
        if self.interval.is_zero() {
            tracing::warn!("push interval is zero, publisher not started");
            return;
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.push_all().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Point;
    use std::net::{IpAddr, Ipv4Addr};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn publisher(targets: Vec<String>) -> ServicePublisher {
        let site = EdgeSite::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), Point::new(1.5, -2.5));
        ServicePublisher::new(
            site,
            Arc::new(LocalServices::new(["web", "echo"])),
            targets,
            Duration::from_secs(10),
        )
        .unwrap()
    }

    #[test]
    fn test_update_is_sorted_declaration() {
        let update = publisher(vec![]).update();
        assert_eq!(update.services, vec!["echo".to_string(), "web".to_string()]);
        assert_eq!(update.origin.address, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[tokio::test]
    async fn test_push_posts_update() {
        let server = MockServer::start().await;
        let expected = serde_json::json!({
            "meta": {"ip": "10.0.0.7", "coords": {"lat": 1.5, "lon": -2.5}},
            "services": ["echo", "web"]
        });
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json(&expected))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = publisher(vec![format!("{}/", server.uri())]);
        assert_eq!(publisher.push_all().await, 1);
    }

    #[tokio::test]
    async fn test_push_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad update"))
            .mount(&server)
            .await;

        let publisher = publisher(vec![server.uri()]);
        let err = publisher.push(&server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("400"));
        assert_eq!(publisher.push_all().await, 0);
    }
}
