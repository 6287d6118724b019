use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::chat::ChatSender;
use crate::error::AppError;
use crate::models::Webhook;
use crate::registry::{Registry, is_well_formed_token};
use crate::template;

/// Fields extracted from an inbound callback request.
pub type Payload = Map<String, Value>;

/// Turns inbound callbacks into chat messages.
#[derive(Clone)]
pub struct DispatchService {
    registry: Arc<Registry>,
    chat: Arc<dyn ChatSender>,
    delivery_timeout: Duration,
    err_report_conv: Option<String>,
}

impl DispatchService {
    pub fn new(
        registry: Arc<Registry>,
        chat: Arc<dyn ChatSender>,
        delivery_timeout: Duration,
        err_report_conv: Option<String>,
    ) -> Self {
        Self {
            registry,
            chat,
            delivery_timeout,
            err_report_conv,
        }
    }

    /// Looks up the webhook behind a callback token.
    pub async fn resolve(&self, token: &str) -> Result<Webhook, AppError> {
        if !is_well_formed_token(token) {
            return Err(AppError::InvalidToken);
        }
        self.registry.resolve(token).await
    }

    /// Renders `payload` for `hook` and posts it into its conversation. Not
    /// retried on failure; the caller owns retry policy.
    pub async fn deliver(&self, hook: &Webhook, payload: Payload) -> Result<(), AppError> {
        if payload.is_empty() {
            return Err(AppError::EmptyPayload);
        }

        // A stored template that no longer parses is skipped, not disabled.
        let text = match template::render(&payload, hook.template.as_deref()) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    conversation_id = %hook.conversation_id,
                    name = %hook.name,
                    "Stored template failed to parse: {e}"
                );
                self.report(&format!(
                    "webhook `{}` has an invalid template and was skipped: {e}",
                    hook.name
                ))
                .await;
                return Err(e.into());
            }
        };
        if text.trim().is_empty() {
            return Err(AppError::EmptyPayload);
        }

        let delivery = self.chat.send_message(&hook.conversation_id, &text);
        let outcome = match tokio::time::timeout(self.delivery_timeout, delivery).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.delivery_timeout.as_secs()
            )),
        };

        if let Err(reason) = outcome {
            warn!(
                conversation_id = %hook.conversation_id,
                name = %hook.name,
                "Failed to deliver webhook message: {reason}"
            );
            self.report(&format!(
                "failed to deliver a message for webhook `{}` in {}: {reason}",
                hook.name, hook.conversation_id
            ))
            .await;
            return Err(AppError::Delivery(reason));
        }

        info!(
            conversation_id = %hook.conversation_id,
            name = %hook.name,
            "Delivered webhook message"
        );
        Ok(())
    }

    /// Best-effort notice to the operators' conversation, if one is set.
    async fn report(&self, text: &str) {
        let Some(conv) = self.err_report_conv.as_deref() else {
            return;
        };
        let send = self.chat.send_message(conv, text);
        match tokio::time::timeout(self.delivery_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to post error report: {e}"),
            Err(_) => warn!("Timed out posting error report"),
        }
    }
}
