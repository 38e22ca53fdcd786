use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Acknowledgement body expected by the payment provider.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}
