pub mod auth_service;
pub mod checkout_service;
pub mod order_service;
pub mod pricing;
pub mod product_service;
pub mod user_service;
pub mod webhook_service;
