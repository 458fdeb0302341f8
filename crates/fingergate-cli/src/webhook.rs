use fingergate_core::notify::{self, Delivery, UreqTransport, WebhookEnvelope, WebhookTransport};
use fingergate_core::AppError;
use serde::Serialize;

use crate::config::Settings;
use crate::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookTestOutcome {
    pub url: String,
    pub status: u16,
    pub delivered: bool,
    pub authorized: bool,
}

pub fn run_webhook_test(settings: &Settings) -> AppResult<WebhookTestOutcome> {
    run_webhook_test_with(settings, &UreqTransport)
}

/// Posts a TEST envelope synchronously through `transport`.
pub fn run_webhook_test_with(
    settings: &Settings,
    transport: &dyn WebhookTransport,
) -> AppResult<WebhookTestOutcome> {
    let config = settings.webhook_config().ok_or_else(|| {
        AppError::Config("webhook_url is not configured (set FINGERGATE_WEBHOOK_URL)".into())
    })?;
    let (status, delivered) = match notify::deliver(&config, transport, &WebhookEnvelope::test())? {
        Delivery::Delivered { status } => (status, true),
        Delivery::Rejected { status } => (status, false),
    };
    Ok(WebhookTestOutcome {
        url: config.url,
        status,
        delivered,
        authorized: config.token.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingergate_config::ResolvedConfig;
    use fingergate_core::notify::WebhookConfig;
    use std::sync::Mutex;

    struct RecordingTransport {
        status: u16,
        bodies: Mutex<Vec<String>>,
    }

    impl WebhookTransport for RecordingTransport {
        fn post(&self, _config: &WebhookConfig, body: &str) -> AppResult<Delivery> {
            self.bodies.lock().unwrap().push(body.to_string());
            if (200..300).contains(&self.status) {
                Ok(Delivery::Delivered {
                    status: self.status,
                })
            } else {
                Ok(Delivery::Rejected {
                    status: self.status,
                })
            }
        }
    }

    fn settings_with_url(url: Option<&str>) -> Settings {
        let mut resolved = ResolvedConfig::default();
        resolved.webhook_url = url.map(str::to_string);
        resolved.webhook_token = Some("secret".into());
        Settings::from_resolved(resolved)
    }

    #[test]
    fn test_envelope_is_posted() {
        let transport = RecordingTransport {
            status: 204,
            bodies: Mutex::new(Vec::new()),
        };
        let outcome =
            run_webhook_test_with(&settings_with_url(Some("http://hook.local/x")), &transport)
                .unwrap();
        assert!(outcome.delivered);
        assert!(outcome.authorized);
        assert_eq!(outcome.status, 204);

        let bodies = transport.bodies.lock().unwrap();
        let body: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(body["detecttype"], "TEST");
    }

    #[test]
    fn rejected_status_is_reported_not_raised() {
        let transport = RecordingTransport {
            status: 500,
            bodies: Mutex::new(Vec::new()),
        };
        let outcome =
            run_webhook_test_with(&settings_with_url(Some("http://hook.local/x")), &transport)
                .unwrap();
        assert!(!outcome.delivered);
        assert_eq!(outcome.status, 500);
    }

    #[test]
    fn missing_url_is_a_config_error() {
        let transport = RecordingTransport {
            status: 200,
            bodies: Mutex::new(Vec::new()),
        };
        assert!(matches!(
            run_webhook_test_with(&settings_with_url(None), &transport),
            Err(AppError::Config(_))
        ));
    }
}
