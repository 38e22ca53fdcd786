use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    models::{
        NewOrder, NewProduct, NewUser, Order, OrderStatus, Product, ProductChanges, User,
        UserChanges,
    },
    routes::params::{ProductSortBy, SortOrder},
};

pub mod memory;
pub mod orm;

pub use memory::MemoryStore;
pub use orm::OrmStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ORM error")]
    Orm(#[from] sea_orm::DbErr),

    #[error("Database error")]
    Db(#[from] sqlx::Error),

    #[error("unique constraint violated: {0}")]
    Conflict(String),

    #[error("insufficient stock for product {0}")]
    InsufficientStock(Uuid),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct ProductFilter {
    pub search: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub sort_by: ProductSortBy,
    pub sort_order: SortOrder,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub sort_order: SortOrder,
    pub limit: u64,
    pub offset: u64,
}

/// Result of reconciling a provider outcome onto an order.
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub status: OrderStatus,
    pub success: bool,
    pub provider: String,
    pub provider_payment_id: String,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct UserFilter {
    pub limit: u64,
    pub offset: u64,
}

/// What finalizing an order's reservations did to product stock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settlement {
    /// Reservations consumed by this call.
    pub consumed: u64,
    /// Products whose stock could not cover the reserved quantity. Their
    /// stock was left untouched.
    pub short: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub enum Transition {
    /// The order left `pending` with this call.
    Applied(Order),
    /// The order had already left `pending`; nothing was written.
    Unchanged(Order),
    NotFound,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Returns the products that exist among `ids`; unknown ids are simply absent.
    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Product>>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Product>>;
    async fn list(&self, filter: &ProductFilter) -> StoreResult<(Vec<Product>, u64)>;
    async fn create(&self, product: NewProduct) -> StoreResult<Product>;
    async fn update(&self, id: Uuid, changes: ProductChanges) -> StoreResult<Option<Product>>;
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a `pending` order without payment, together with one stock
    /// reservation per line held until `order.reserve_until`.
    ///
    /// Availability (stock minus unexpired holds) is checked under a row lock
    /// on the products in the same transaction. Fails with
    /// [`StoreError::InsufficientStock`] when a line cannot be covered and with
    /// [`StoreError::Conflict`] when the idempotency key is already taken.
    async fn create(&self, order: NewOrder) -> StoreResult<Order>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Order>>;
    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Order>>;
    /// Records the provider payment id on a pending order that has none yet,
    /// and returns the order as stored afterwards.
    async fn attach_payment(
        &self,
        id: Uuid,
        provider: &str,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>>;
    /// Moves the order out of `pending` only if it is still `pending`.
    async fn complete_payment(&self, id: Uuid, outcome: PaymentOutcome) -> StoreResult<Transition>;
    async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: &OrderFilter,
    ) -> StoreResult<(Vec<Order>, u64)>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Replaces the order's holds with one per line held until `until`,
    /// re-checking availability against every other unexpired hold.
    async fn renew(&self, order_id: Uuid, until: DateTime<Utc>) -> StoreResult<()>;
    /// Turns the order's reservations into stock decrements. A decrement that
    /// would take stock below zero is skipped and reported in
    /// [`Settlement::short`].
    async fn finalize(&self, order_id: Uuid) -> StoreResult<Settlement>;
    /// Drops the order's reservations without touching stock.
    async fn release(&self, order_id: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn list(&self, filter: &UserFilter) -> StoreResult<(Vec<User>, u64)>;
    async fn create(&self, user: NewUser) -> StoreResult<User>;
    /// Fails with [`StoreError::Conflict`] when the new email is taken.
    async fn update(&self, id: Uuid, changes: UserChanges) -> StoreResult<Option<User>>;
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<Uuid>,
    pub action: String,
    pub resource: Option<String>,
    pub metadata: Option<Value>,
}

impl AuditEntry {
    pub fn new(action: &str, resource: &str) -> Self {
        Self {
            user_id: None,
            action: action.to_string(),
            resource: Some(resource.to_string()),
            metadata: None,
        }
    }

    pub fn by(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> StoreResult<()>;
}
