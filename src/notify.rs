//! Notification client: fires a webhook when a tunnel gets restarted.
//!
//! Failures here are swallowed after a logged warning — a broken webhook
//! endpoint must never take down the tunnel it's reporting on.

use serde::Serialize;
use tracing::warn;

use crate::model::Forwarding;

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts restart notifications to each forwarding's configured webhook.
pub struct Notifier {
    client: reqwest::Client,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// POST `{"text": msg}` to `forwarding`'s `notify_url`, if any. Any
    /// transport or non-2xx response is logged and discarded.
    pub async fn notify(&self, forwarding: &Forwarding, msg: &str) {
        let Some(url) = &forwarding.validate.notify_url else {
            return;
        };

        let result = self
            .client
            .post(url)
            .json(&WebhookPayload { text: msg })
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(
                    "webhook error, cannot post to \"{url}\": unexpected status {}",
                    response.status()
                );
            }
            Err(e) => {
                warn!("webhook error, cannot post to \"{url}\": {e}");
            }
        }
    }

    /// Notify about a restart, but only once the forwarding has actually
    /// restarted at least once — the first start is not a restart.
    pub async fn notify_tunnel_restarted(&self, forwarding: &Forwarding) {
        let count = forwarding.current_restart_count();
        if count == 0 {
            return;
        }

        let msg = format!(
            ":warning: The tunnel \"{}\" was restarted, current restart count is {count}",
            forwarding.ident()
        );
        self.notify(forwarding, &msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ForwardingMode, PortDefinition, ValidationMethod, ValidationSpec};

    fn forwarding_without_notify_url() -> Forwarding {
        Forwarding::new(
            PortDefinition {
                gateway: false,
                host: None,
                port: "8080".to_string(),
            },
            PortDefinition {
                gateway: false,
                host: Some("127.0.0.1".to_string()),
                port: "80".to_string(),
            },
            ValidationSpec {
                method: ValidationMethod::None,
                interval_secs: 30,
                wait_time_before_restart_secs: 5,
                kill_existing_tunnel_on_failure: true,
                notify_url: None,
            },
            ForwardingMode::Remote,
            "example-host".to_string(),
        )
    }

    #[tokio::test]
    async fn notify_is_a_no_op_without_a_configured_url() {
        let forwarding = forwarding_without_notify_url();
        let notifier = Notifier::new();
        notifier.notify(&forwarding, "hello").await;
    }

    #[tokio::test]
    async fn notify_tunnel_restarted_is_a_no_op_before_first_restart() {
        let forwarding = forwarding_without_notify_url();
        forwarding.on_tunnel_started();
        assert_eq!(forwarding.current_restart_count(), 0);

        let notifier = Notifier::new();
        notifier.notify_tunnel_restarted(&forwarding).await;
    }
}
