// Operator notifications
//
// Email: Resend when an API key is configured
// Fallback: tracing only

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::{AppError, AppResult, RailError};

#[async_trait]
pub trait OperatorNotifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> AppResult<()>;
}

/// Picks the Resend client when fully configured, the log notifier otherwise
pub fn from_config(config: &NotificationConfig) -> AppResult<Box<dyn OperatorNotifier>> {
    match (&config.resend_api_key, &config.from_email, &config.admin_email) {
        (Some(key), Some(from), Some(to)) => Ok(Box::new(ResendEmailNotifier::new(
            key.clone(),
            from.clone(),
            to.clone(),
        )?)),
        _ => {
            info!("📭 Email not configured, operator alerts go to the log only");
            Ok(Box::new(LogNotifier))
        }
    }
}

// ============ EMAIL (RESEND) ============

pub struct ResendEmailNotifier {
    api_key: String,
    from_email: String,
    admin_email: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    to: &'a str,
    from: &'a str,
    subject: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

impl ResendEmailNotifier {
    pub fn new(api_key: String, from_email: String, admin_email: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            api_key,
            from_email,
            admin_email,
            client,
        })
    }
}

#[async_trait]
impl OperatorNotifier for ResendEmailNotifier {
    async fn notify(&self, subject: &str, body: &str) -> AppResult<()> {
        let response = self
            .client
            .post("https://api.resend.com/emails")
            .bearer_auth(&self.api_key)
            .json(&ResendEmailRequest {
                to: &self.admin_email,
                from: &self.from_email,
                subject,
                text: body,
            })
            .send()
            .await
            .map_err(RailError::from)?;

        if !response.status().is_success() {
            return Err(RailError::Rejected {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            }
            .into());
        }

        let sent: ResendEmailResponse = response.json().await.map_err(RailError::from)?;
        info!("📧 Operator email sent via Resend: {}", sent.id);
        Ok(())
    }
}

// ============ LOG ONLY ============

pub struct LogNotifier;

#[async_trait]
impl OperatorNotifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> AppResult<()> {
        warn!("🚨 {}\n{}", subject, body);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partial_email_config_falls_back_to_log() {
        let config = NotificationConfig {
            resend_api_key: Some("re_test".into()),
            from_email: None,
            admin_email: Some("ops@example.com".into()),
        };
        let notifier = from_config(&config).unwrap();
        assert!(notifier.notify("subject", "body").await.is_ok());
    }
}
