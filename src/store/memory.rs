use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    models::{
        NewOrder, NewProduct, NewUser, Order, OrderStatus, Payment, Product, ProductChanges,
        Reservation, User, UserChanges,
    },
    routes::params::{ProductSortBy, SortOrder},
};

use super::{
    AuditEntry, AuditLog, CatalogStore, OrderFilter, OrderStore, PaymentOutcome, ProductFilter,
    ReservationStore, Settlement, StoreError, StoreResult, Transition, UserFilter, UserStore,
};

/// Process-local store backing every store trait with one lock.
///
/// Each operation runs under the lock, so the conditional updates behave
/// like single-document atomic writes.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    products: Vec<Product>,
    orders: Vec<Order>,
    reservations: Vec<Reservation>,
    users: Vec<User>,
    audit: Vec<AuditEntry>,
    order_writes: u64,
}

impl State {
    /// Fails when any product cannot cover its summed quantity after the
    /// unexpired holds of other orders.
    fn ensure_available(
        &self,
        lines: impl Iterator<Item = (Uuid, i32)>,
        now: DateTime<Utc>,
        except_order: Option<Uuid>,
    ) -> StoreResult<()> {
        let mut wanted: HashMap<Uuid, i64> = HashMap::new();
        for (product_id, quantity) in lines {
            *wanted.entry(product_id).or_insert(0) += i64::from(quantity);
        }

        for (product_id, quantity) in wanted {
            let stock = self
                .products
                .iter()
                .find(|p| p.id == product_id)
                .map_or(0, |p| i64::from(p.stock));
            let held: i64 = self
                .reservations
                .iter()
                .filter(|r| r.product_id == product_id && r.expires_at > now)
                .filter(|r| Some(r.order_id) != except_order)
                .map(|r| i64::from(r.quantity))
                .sum();
            if quantity > stock - held {
                return Err(StoreError::InsufficientStock(product_id));
            }
        }
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }

    /// Number of order mutations that were actually applied.
    pub async fn order_writes(&self) -> u64 {
        self.inner.lock().await.order_writes
    }

    pub async fn order_count(&self) -> usize {
        self.inner.lock().await.orders.len()
    }

    pub async fn reservations_for(&self, order_id: Uuid) -> Vec<Reservation> {
        self.inner
            .lock()
            .await
            .reservations
            .iter()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Product>> {
        let state = self.inner.lock().await;
        Ok(state
            .products
            .iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Product>> {
        let state = self.inner.lock().await;
        Ok(state.products.iter().find(|p| p.id == id).cloned())
    }

    async fn list(&self, filter: &ProductFilter) -> StoreResult<(Vec<Product>, u64)> {
        let state = self.inner.lock().await;
        let needle = filter.search.as_ref().map(|s| s.to_lowercase());
        let mut items: Vec<Product> = state
            .products
            .iter()
            .filter(|p| {
                needle
                    .as_ref()
                    .is_none_or(|n| p.title.to_lowercase().contains(n))
            })
            .filter(|p| filter.min_price.is_none_or(|min| p.price >= min))
            .filter(|p| filter.max_price.is_none_or(|max| p.price <= max))
            .cloned()
            .collect();

        items.sort_by(|a, b| {
            let ordering = match filter.sort_by {
                ProductSortBy::CreatedAt => a.created_at.cmp(&b.created_at),
                ProductSortBy::Price => a.price.cmp(&b.price),
                ProductSortBy::Title => a.title.cmp(&b.title),
            };
            match filter.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = items.len() as u64;
        let page = items
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn create(&self, product: NewProduct) -> StoreResult<Product> {
        let mut state = self.inner.lock().await;
        let product = Product {
            id: Uuid::new_v4(),
            title: product.title,
            description: product.description,
            price: product.price,
            currency: product.currency,
            image_url: product.image_url,
            stock: product.stock,
            created_at: Utc::now(),
        };
        state.products.push(product.clone());
        Ok(product)
    }

    async fn update(&self, id: Uuid, changes: ProductChanges) -> StoreResult<Option<Product>> {
        let mut state = self.inner.lock().await;
        let Some(product) = state.products.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        if let Some(title) = changes.title {
            product.title = title;
        }
        if let Some(description) = changes.description {
            product.description = Some(description);
        }
        if let Some(price) = changes.price {
            product.price = price;
        }
        if let Some(currency) = changes.currency {
            product.currency = currency;
        }
        if let Some(image_url) = changes.image_url {
            product.image_url = Some(image_url);
        }
        if let Some(stock) = changes.stock {
            product.stock = stock;
        }
        Ok(Some(product.clone()))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.inner.lock().await;
        let before = state.products.len();
        state.products.retain(|p| p.id != id);
        Ok(state.products.len() != before)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn create(&self, order: NewOrder) -> StoreResult<Order> {
        let mut state = self.inner.lock().await;
        if let Some(key) = order.idempotency_key.as_deref() {
            if state
                .orders
                .iter()
                .any(|o| o.idempotency_key.as_deref() == Some(key))
            {
                return Err(StoreError::Conflict("orders_idempotency_key".into()));
            }
        }

        let now = Utc::now();
        state.ensure_available(
            order.items.iter().map(|i| (i.product_id, i.quantity)),
            now,
            None,
        )?;

        let order_id = Uuid::new_v4();
        let reservations: Vec<Reservation> = order
            .items
            .iter()
            .map(|item| Reservation {
                id: Uuid::new_v4(),
                product_id: item.product_id,
                order_id,
                quantity: item.quantity,
                expires_at: order.reserve_until,
            })
            .collect();
        let order = Order {
            id: order_id,
            user_id: order.user_id,
            customer_email: order.customer_email,
            items: order.items,
            subtotal_minor_units: order.subtotal_minor_units,
            shipping_minor_units: order.shipping_minor_units,
            tax_minor_units: order.tax_minor_units,
            discount_minor_units: order.discount_minor_units,
            total_minor_units: order.total_minor_units,
            currency: order.currency,
            status: OrderStatus::Pending,
            payment: None,
            shipping_address: order.shipping_address,
            shipping_method: order.shipping_method,
            discount_code: order.discount_code,
            idempotency_key: order.idempotency_key,
            created_at: now,
            updated_at: now,
        };
        state.orders.push(order.clone());
        state.reservations.extend(reservations);
        state.order_writes += 1;
        Ok(order)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let state = self.inner.lock().await;
        Ok(state.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Order>> {
        let state = self.inner.lock().await;
        Ok(state
            .orders
            .iter()
            .find(|o| o.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn attach_payment(
        &self,
        id: Uuid,
        provider: &str,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>> {
        let mut state = self.inner.lock().await;
        let Some(order) = state.orders.iter_mut().find(|o| o.id == id) else {
            return Ok(None);
        };
        if order.status != OrderStatus::Pending || order.payment.is_some() {
            return Ok(Some(order.clone()));
        }
        order.payment = Some(Payment {
            provider: provider.to_string(),
            provider_payment_id: provider_payment_id.to_string(),
            success: false,
            raw: serde_json::json!({}),
        });
        order.updated_at = Utc::now();
        let order = order.clone();
        state.order_writes += 1;
        Ok(Some(order))
    }

    async fn complete_payment(&self, id: Uuid, outcome: PaymentOutcome) -> StoreResult<Transition> {
        let mut state = self.inner.lock().await;
        let Some(order) = state.orders.iter_mut().find(|o| o.id == id) else {
            return Ok(Transition::NotFound);
        };
        if order.status != OrderStatus::Pending {
            return Ok(Transition::Unchanged(order.clone()));
        }

        order.status = outcome.status;
        let payment = order.payment.get_or_insert_with(|| Payment {
            provider: outcome.provider.clone(),
            provider_payment_id: outcome.provider_payment_id.clone(),
            success: false,
            raw: serde_json::json!({}),
        });
        payment.success = outcome.success;
        payment.raw = outcome.raw;
        order.updated_at = Utc::now();
        let order = order.clone();
        state.order_writes += 1;
        Ok(Transition::Applied(order))
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: &OrderFilter,
    ) -> StoreResult<(Vec<Order>, u64)> {
        let state = self.inner.lock().await;
        let mut items: Vec<Order> = state
            .orders
            .iter()
            .filter(|o| o.user_id == Some(user_id))
            .filter(|o| filter.status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        items.sort_by_key(|o| o.created_at);
        if matches!(filter.sort_order, SortOrder::Desc) {
            items.reverse();
        }
        let total = items.len() as u64;
        let page = items
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn renew(&self, order_id: Uuid, until: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.inner.lock().await;
        let lines = state
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .map(Order::cart_lines)
            .unwrap_or_default();
        state.ensure_available(lines.iter().copied(), Utc::now(), Some(order_id))?;

        state.reservations.retain(|r| r.order_id != order_id);
        state
            .reservations
            .extend(lines.into_iter().map(|(product_id, quantity)| Reservation {
                id: Uuid::new_v4(),
                product_id,
                order_id,
                quantity,
                expires_at: until,
            }));
        Ok(())
    }

    async fn finalize(&self, order_id: Uuid) -> StoreResult<Settlement> {
        let mut state = self.inner.lock().await;
        let (consumed, kept): (Vec<Reservation>, Vec<Reservation>) = state
            .reservations
            .drain(..)
            .partition(|r| r.order_id == order_id);
        state.reservations = kept;

        let mut settlement = Settlement {
            consumed: consumed.len() as u64,
            short: Vec::new(),
        };
        for r in &consumed {
            match state.products.iter_mut().find(|p| p.id == r.product_id) {
                Some(product) if product.stock >= r.quantity => product.stock -= r.quantity,
                _ => settlement.short.push(r.product_id),
            }
        }
        Ok(settlement)
    }

    async fn release(&self, order_id: Uuid) -> StoreResult<u64> {
        let mut state = self.inner.lock().await;
        let before = state.reservations.len();
        state.reservations.retain(|r| r.order_id != order_id);
        Ok((before - state.reservations.len()) as u64)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let state = self.inner.lock().await;
        Ok(state.users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let state = self.inner.lock().await;
        Ok(state.users.iter().find(|u| u.id == id).cloned())
    }

    async fn list(&self, filter: &UserFilter) -> StoreResult<(Vec<User>, u64)> {
        let state = self.inner.lock().await;
        let mut users = state.users.clone();
        users.sort_by_key(|u| u.created_at);
        let total = users.len() as u64;
        let page = users
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn create(&self, user: NewUser) -> StoreResult<User> {
        let mut state = self.inner.lock().await;
        if state.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("users_email_key".into()));
        }
        let user = User {
            id: Uuid::new_v4(),
            name: user.name,
            email: user.email,
            password_hash: user.password_hash,
            role: user.role,
            created_at: Utc::now(),
        };
        state.users.push(user.clone());
        Ok(user)
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> StoreResult<Option<User>> {
        let mut state = self.inner.lock().await;
        if let Some(email) = changes.email.as_deref() {
            if state.users.iter().any(|u| u.id != id && u.email == email) {
                return Err(StoreError::Conflict("users_email_key".into()));
            }
        }
        let Some(user) = state.users.iter_mut().find(|u| u.id == id) else {
            return Ok(None);
        };
        if let Some(name) = changes.name {
            user.name = name;
        }
        if let Some(email) = changes.email {
            user.email = email;
        }
        if let Some(password_hash) = changes.password_hash {
            user.password_hash = password_hash;
        }
        Ok(Some(user.clone()))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.inner.lock().await;
        let before = state.users.len();
        state.users.retain(|u| u.id != id);
        if state.users.len() == before {
            return Ok(false);
        }
        for order in state.orders.iter_mut().filter(|o| o.user_id == Some(id)) {
            order.user_id = None;
        }
        Ok(true)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn record(&self, entry: AuditEntry) -> StoreResult<()> {
        self.inner.lock().await.audit.push(entry);
        Ok(())
    }
}
