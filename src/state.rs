use std::sync::Arc;

use crate::{
    config::CheckoutConfig,
    middleware::auth::{JwtAuth, TokenVerifier},
    payments::PaymentGateway,
    services::pricing::PricingPolicy,
    store::{AuditLog, CatalogStore, OrderStore, ReservationStore, UserStore},
};

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn CatalogStore>,
    pub orders: Arc<dyn OrderStore>,
    pub reservations: Arc<dyn ReservationStore>,
    pub users: Arc<dyn UserStore>,
    pub audit: Arc<dyn AuditLog>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub auth: Arc<dyn TokenVerifier>,
    pub tokens: Arc<JwtAuth>,
    pub pricing: PricingPolicy,
    pub checkout: CheckoutConfig,
}
