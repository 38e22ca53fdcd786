use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Func, LockType, SimpleExpr, extension::postgres::PgExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    SqlErr, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    entity::{
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
            Model as OrderItemModel,
        },
        orders::{ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel},
        products::{ActiveModel as ProductActive, Column as ProdCol, Entity as Products, Model as ProductModel},
        reservations::{ActiveModel as ReservationActive, Column as ResCol, Entity as Reservations},
        users::{ActiveModel as UserActive, Column as UserCol, Entity as Users, Model as UserModel},
    },
    models::{
        NewOrder, NewProduct, NewUser, Order, OrderItem, OrderStatus, Payment, Product,
        ProductChanges, User, UserChanges,
    },
    routes::params::{ProductSortBy, SortOrder},
};

use super::{
    CatalogStore, OrderFilter, OrderStore, PaymentOutcome, ProductFilter, ReservationStore,
    Settlement, StoreError, StoreResult, Transition, UserFilter, UserStore,
};

/// Postgres-backed store built on SeaORM entities.
#[derive(Clone)]
pub struct OrmStore {
    orm: DatabaseConnection,
}

impl OrmStore {
    pub fn new(orm: DatabaseConnection) -> Self {
        Self { orm }
    }

    async fn load_order<C: ConnectionTrait>(conn: &C, model: OrderModel) -> StoreResult<Order> {
        let items = OrderItems::find()
            .filter(OrderItemCol::OrderId.eq(model.id))
            .order_by_asc(OrderItemCol::Position)
            .all(conn)
            .await?;
        order_from_entity(model, items)
    }
}

#[derive(Debug, FromQueryResult)]
struct ReservedRow {
    product_id: Uuid,
    quantity: i64,
}

/// Locks the product rows of `lines` and fails unless each product covers its
/// summed quantity after the unexpired holds of other orders.
async fn ensure_available<C: ConnectionTrait>(
    conn: &C,
    lines: &[(Uuid, i32)],
    now: DateTime<Utc>,
    except_order: Option<Uuid>,
) -> StoreResult<()> {
    let mut wanted: HashMap<Uuid, i64> = HashMap::new();
    for &(product_id, quantity) in lines {
        *wanted.entry(product_id).or_insert(0) += i64::from(quantity);
    }
    let mut ids: Vec<Uuid> = wanted.keys().copied().collect();
    ids.sort_unstable();

    // Fixed lock order keeps concurrent checkouts from deadlocking.
    let stock: HashMap<Uuid, i64> = Products::find()
        .filter(ProdCol::Id.is_in(ids.clone()))
        .order_by_asc(ProdCol::Id)
        .lock(LockType::Update)
        .all(conn)
        .await?
        .into_iter()
        .map(|p| (p.id, i64::from(p.stock)))
        .collect();

    let now: sea_orm::prelude::DateTimeWithTimeZone = now.into();
    let mut held_query = Reservations::find()
        .select_only()
        .column(ResCol::ProductId)
        .column_as(Expr::col(ResCol::Quantity).sum(), "quantity")
        .filter(ResCol::ProductId.is_in(ids))
        .filter(ResCol::ExpiresAt.gt(now));
    if let Some(order_id) = except_order {
        held_query = held_query.filter(ResCol::OrderId.ne(order_id));
    }
    let held: HashMap<Uuid, i64> = held_query
        .group_by(ResCol::ProductId)
        .into_model::<ReservedRow>()
        .all(conn)
        .await?
        .into_iter()
        .map(|row| (row.product_id, row.quantity))
        .collect();

    for (product_id, quantity) in wanted {
        let available = stock.get(&product_id).copied().unwrap_or(0)
            - held.get(&product_id).copied().unwrap_or(0);
        if quantity > available {
            return Err(StoreError::InsufficientStock(product_id));
        }
    }
    Ok(())
}

fn map_write_err(err: DbErr) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => StoreError::Conflict(detail),
        _ => StoreError::Orm(err),
    }
}

#[async_trait]
impl CatalogStore for OrmStore {
    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Product>> {
        let products = Products::find()
            .filter(ProdCol::Id.is_in(ids.to_vec()))
            .all(&self.orm)
            .await?
            .into_iter()
            .map(product_from_entity)
            .collect();
        Ok(products)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Product>> {
        Ok(Products::find_by_id(id)
            .one(&self.orm)
            .await?
            .map(product_from_entity))
    }

    async fn list(&self, filter: &ProductFilter) -> StoreResult<(Vec<Product>, u64)> {
        let mut condition = Condition::all();
        if let Some(search) = filter.search.as_ref().filter(|s| !s.is_empty()) {
            condition = condition.add(Expr::col(ProdCol::Title).ilike(format!("%{}%", search)));
        }
        if let Some(min_price) = filter.min_price {
            condition = condition.add(ProdCol::Price.gte(min_price));
        }
        if let Some(max_price) = filter.max_price {
            condition = condition.add(ProdCol::Price.lte(max_price));
        }

        let sort_col = match filter.sort_by {
            ProductSortBy::CreatedAt => ProdCol::CreatedAt,
            ProductSortBy::Price => ProdCol::Price,
            ProductSortBy::Title => ProdCol::Title,
        };

        let mut finder = Products::find().filter(condition);
        finder = match filter.sort_order {
            SortOrder::Asc => finder.order_by_asc(sort_col),
            SortOrder::Desc => finder.order_by_desc(sort_col),
        };

        let total = finder.clone().count(&self.orm).await?;
        let items = finder
            .limit(filter.limit)
            .offset(filter.offset)
            .all(&self.orm)
            .await?
            .into_iter()
            .map(product_from_entity)
            .collect();
        Ok((items, total))
    }

    async fn create(&self, product: NewProduct) -> StoreResult<Product> {
        let model = ProductActive {
            id: Set(Uuid::new_v4()),
            title: Set(product.title),
            description: Set(product.description),
            price: Set(product.price),
            currency: Set(product.currency),
            image_url: Set(product.image_url),
            stock: Set(product.stock),
            created_at: Set(Utc::now().into()),
        }
        .insert(&self.orm)
        .await
        .map_err(map_write_err)?;
        Ok(product_from_entity(model))
    }

    async fn update(&self, id: Uuid, changes: ProductChanges) -> StoreResult<Option<Product>> {
        let Some(existing) = Products::find_by_id(id).one(&self.orm).await? else {
            return Ok(None);
        };

        let mut active: ProductActive = existing.into();
        if let Some(title) = changes.title {
            active.title = Set(title);
        }
        if let Some(description) = changes.description {
            active.description = Set(Some(description));
        }
        if let Some(price) = changes.price {
            active.price = Set(price);
        }
        if let Some(currency) = changes.currency {
            active.currency = Set(currency);
        }
        if let Some(image_url) = changes.image_url {
            active.image_url = Set(Some(image_url));
        }
        if let Some(stock) = changes.stock {
            active.stock = Set(stock);
        }

        let model = active.update(&self.orm).await.map_err(map_write_err)?;
        Ok(Some(product_from_entity(model)))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = Products::delete_by_id(id).exec(&self.orm).await?;
        Ok(result.rows_affected > 0)
    }
}

#[async_trait]
impl OrderStore for OrmStore {
    async fn create(&self, order: NewOrder) -> StoreResult<Order> {
        let txn = self.orm.begin().await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let lines: Vec<(Uuid, i32)> = order
            .items
            .iter()
            .map(|item| (item.product_id, item.quantity))
            .collect();

        let model = OrderActive {
            id: Set(order_id),
            user_id: Set(order.user_id),
            customer_email: Set(order.customer_email),
            subtotal_minor_units: Set(order.subtotal_minor_units),
            shipping_minor_units: Set(order.shipping_minor_units),
            tax_minor_units: Set(order.tax_minor_units),
            discount_minor_units: Set(order.discount_minor_units),
            total_minor_units: Set(order.total_minor_units),
            currency: Set(order.currency),
            status: Set(OrderStatus::Pending.to_string()),
            payment_provider: Set(None),
            payment_provider_id: Set(None),
            payment_success: Set(false),
            payment_raw: Set(None),
            shipping_address: Set(order.shipping_address),
            shipping_method: Set(order.shipping_method),
            discount_code: Set(order.discount_code),
            idempotency_key: Set(order.idempotency_key),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(&txn)
        .await
        .map_err(map_write_err)?;

        // After the insert, so a duplicate key surfaces as a conflict first.
        ensure_available(&txn, &lines, now, None).await?;

        let mut items = Vec::with_capacity(order.items.len());
        for (position, item) in order.items.into_iter().enumerate() {
            let row = OrderItemActive {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                position: Set(position as i32),
                product_id: Set(item.product_id),
                title: Set(item.title),
                unit_price_minor_units: Set(item.unit_price_minor_units),
                quantity: Set(item.quantity),
                created_at: Set(now.into()),
            }
            .insert(&txn)
            .await?;

            ReservationActive {
                id: Set(Uuid::new_v4()),
                product_id: Set(row.product_id),
                order_id: Set(order_id),
                quantity: Set(row.quantity),
                expires_at: Set(order.reserve_until.into()),
                created_at: Set(now.into()),
            }
            .insert(&txn)
            .await?;
            items.push(row);
        }

        txn.commit().await?;
        order_from_entity(model, items)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Order>> {
        match Orders::find_by_id(id).one(&self.orm).await? {
            Some(model) => Ok(Some(Self::load_order(&self.orm, model).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Order>> {
        let model = Orders::find()
            .filter(OrderCol::IdempotencyKey.eq(key))
            .one(&self.orm)
            .await?;
        match model {
            Some(model) => Ok(Some(Self::load_order(&self.orm, model).await?)),
            None => Ok(None),
        }
    }

    async fn attach_payment(
        &self,
        id: Uuid,
        provider: &str,
        provider_payment_id: &str,
    ) -> StoreResult<Option<Order>> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        Orders::update_many()
            .col_expr(OrderCol::PaymentProvider, Expr::value(provider.to_string()))
            .col_expr(
                OrderCol::PaymentProviderId,
                Expr::value(provider_payment_id.to_string()),
            )
            .col_expr(OrderCol::PaymentSuccess, Expr::value(false))
            .col_expr(OrderCol::PaymentRaw, Expr::value(serde_json::json!({})))
            .col_expr(OrderCol::UpdatedAt, Expr::value(now))
            .filter(OrderCol::Id.eq(id))
            .filter(OrderCol::Status.eq(OrderStatus::Pending.as_ref()))
            .filter(OrderCol::PaymentProviderId.is_null())
            .exec(&self.orm)
            .await?;

        OrderStore::find_by_id(self, id).await
    }

    async fn complete_payment(&self, id: Uuid, outcome: PaymentOutcome) -> StoreResult<Transition> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        let result = Orders::update_many()
            .col_expr(OrderCol::Status, Expr::value(outcome.status.to_string()))
            .col_expr(OrderCol::PaymentSuccess, Expr::value(outcome.success))
            .col_expr(OrderCol::PaymentRaw, Expr::value(outcome.raw))
            .col_expr(
                OrderCol::PaymentProvider,
                SimpleExpr::FunctionCall(Func::coalesce([
                    SimpleExpr::from(Expr::col(OrderCol::PaymentProvider)),
                    Expr::value(outcome.provider),
                ])),
            )
            .col_expr(
                OrderCol::PaymentProviderId,
                SimpleExpr::FunctionCall(Func::coalesce([
                    SimpleExpr::from(Expr::col(OrderCol::PaymentProviderId)),
                    Expr::value(outcome.provider_payment_id),
                ])),
            )
            .col_expr(OrderCol::UpdatedAt, Expr::value(now))
            .filter(OrderCol::Id.eq(id))
            .filter(OrderCol::Status.eq(OrderStatus::Pending.as_ref()))
            .exec(&self.orm)
            .await?;

        let current = OrderStore::find_by_id(self, id).await?;
        Ok(match (result.rows_affected, current) {
            (_, None) => Transition::NotFound,
            (1, Some(order)) => Transition::Applied(order),
            (_, Some(order)) => Transition::Unchanged(order),
        })
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        filter: &OrderFilter,
    ) -> StoreResult<(Vec<Order>, u64)> {
        let mut condition = Condition::all().add(OrderCol::UserId.eq(user_id));
        if let Some(status) = filter.status {
            condition = condition.add(OrderCol::Status.eq(status.as_ref()));
        }

        let mut finder = Orders::find().filter(condition);
        finder = match filter.sort_order {
            SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
            SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
        };

        let total = finder.clone().count(&self.orm).await?;
        let models = finder
            .limit(filter.limit)
            .offset(filter.offset)
            .all(&self.orm)
            .await?;

        let ids: Vec<Uuid> = models.iter().map(|m| m.id).collect();
        let mut items_by_order: HashMap<Uuid, Vec<OrderItemModel>> = HashMap::new();
        for item in OrderItems::find()
            .filter(OrderItemCol::OrderId.is_in(ids))
            .order_by_asc(OrderItemCol::Position)
            .all(&self.orm)
            .await?
        {
            items_by_order.entry(item.order_id).or_default().push(item);
        }

        let orders = models
            .into_iter()
            .map(|model| {
                let items = items_by_order.remove(&model.id).unwrap_or_default();
                order_from_entity(model, items)
            })
            .collect::<StoreResult<Vec<_>>>()?;
        Ok((orders, total))
    }
}

#[async_trait]
impl ReservationStore for OrmStore {
    async fn renew(&self, order_id: Uuid, until: DateTime<Utc>) -> StoreResult<()> {
        let txn = self.orm.begin().await?;
        let now = Utc::now();
        let lines: Vec<(Uuid, i32)> = OrderItems::find()
            .filter(OrderItemCol::OrderId.eq(order_id))
            .order_by_asc(OrderItemCol::Position)
            .all(&txn)
            .await?
            .into_iter()
            .map(|item| (item.product_id, item.quantity))
            .collect();
        ensure_available(&txn, &lines, now, Some(order_id)).await?;

        Reservations::delete_many()
            .filter(ResCol::OrderId.eq(order_id))
            .exec(&txn)
            .await?;
        for (product_id, quantity) in lines {
            ReservationActive {
                id: Set(Uuid::new_v4()),
                product_id: Set(product_id),
                order_id: Set(order_id),
                quantity: Set(quantity),
                expires_at: Set(until.into()),
                created_at: Set(now.into()),
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn finalize(&self, order_id: Uuid) -> StoreResult<Settlement> {
        let txn = self.orm.begin().await?;
        let held = Reservations::find()
            .filter(ResCol::OrderId.eq(order_id))
            .lock(LockType::Update)
            .all(&txn)
            .await?;

        let mut short = Vec::new();
        for reservation in &held {
            let updated = Products::update_many()
                .col_expr(ProdCol::Stock, Expr::col(ProdCol::Stock).sub(reservation.quantity))
                .filter(ProdCol::Id.eq(reservation.product_id))
                .filter(ProdCol::Stock.gte(reservation.quantity))
                .exec(&txn)
                .await?;
            if updated.rows_affected == 0 {
                short.push(reservation.product_id);
            }
        }

        let ids: Vec<Uuid> = held.iter().map(|r| r.id).collect();
        let deleted = Reservations::delete_many()
            .filter(ResCol::Id.is_in(ids))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(Settlement {
            consumed: deleted.rows_affected,
            short,
        })
    }

    async fn release(&self, order_id: Uuid) -> StoreResult<u64> {
        let deleted = Reservations::delete_many()
            .filter(ResCol::OrderId.eq(order_id))
            .exec(&self.orm)
            .await?;
        Ok(deleted.rows_affected)
    }
}

#[async_trait]
impl UserStore for OrmStore {
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(Users::find()
            .filter(UserCol::Email.eq(email))
            .one(&self.orm)
            .await?
            .map(user_from_entity))
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(Users::find_by_id(id)
            .one(&self.orm)
            .await?
            .map(user_from_entity))
    }

    async fn list(&self, filter: &UserFilter) -> StoreResult<(Vec<User>, u64)> {
        let finder = Users::find().order_by_asc(UserCol::CreatedAt);
        let total = finder.clone().count(&self.orm).await?;
        let users = finder
            .limit(filter.limit)
            .offset(filter.offset)
            .all(&self.orm)
            .await?
            .into_iter()
            .map(user_from_entity)
            .collect();
        Ok((users, total))
    }

    async fn create(&self, user: NewUser) -> StoreResult<User> {
        let model = UserActive {
            id: Set(Uuid::new_v4()),
            name: Set(user.name),
            email: Set(user.email),
            password_hash: Set(user.password_hash),
            role: Set(user.role),
            created_at: Set(Utc::now().into()),
        }
        .insert(&self.orm)
        .await
        .map_err(map_write_err)?;
        Ok(user_from_entity(model))
    }

    async fn update(&self, id: Uuid, changes: UserChanges) -> StoreResult<Option<User>> {
        let Some(existing) = Users::find_by_id(id).one(&self.orm).await? else {
            return Ok(None);
        };

        let mut active: UserActive = existing.into();
        if let Some(name) = changes.name {
            active.name = Set(name);
        }
        if let Some(email) = changes.email {
            active.email = Set(email);
        }
        if let Some(password_hash) = changes.password_hash {
            active.password_hash = Set(password_hash);
        }

        let model = active.update(&self.orm).await.map_err(map_write_err)?;
        Ok(Some(user_from_entity(model)))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = Users::delete_by_id(id).exec(&self.orm).await?;
        Ok(result.rows_affected > 0)
    }
}

fn product_from_entity(model: ProductModel) -> Product {
    Product {
        id: model.id,
        title: model.title,
        description: model.description,
        price: model.price,
        currency: model.currency,
        image_url: model.image_url,
        stock: model.stock,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn user_from_entity(model: UserModel) -> User {
    User {
        id: model.id,
        name: model.name,
        email: model.email,
        password_hash: model.password_hash,
        role: model.role,
        created_at: model.created_at.with_timezone(&Utc),
    }
}

fn order_from_entity(model: OrderModel, items: Vec<OrderItemModel>) -> StoreResult<Order> {
    let status: OrderStatus = model
        .status
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("order {} has status {}", model.id, model.status)))?;

    let payment = match (model.payment_provider, model.payment_provider_id) {
        (Some(provider), Some(provider_payment_id)) => Some(Payment {
            provider,
            provider_payment_id,
            success: model.payment_success,
            raw: model.payment_raw.unwrap_or_else(|| serde_json::json!({})),
        }),
        _ => None,
    };

    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        customer_email: model.customer_email,
        items: items
            .into_iter()
            .map(|item| OrderItem {
                product_id: item.product_id,
                title: item.title,
                unit_price_minor_units: item.unit_price_minor_units,
                quantity: item.quantity,
            })
            .collect(),
        subtotal_minor_units: model.subtotal_minor_units,
        shipping_minor_units: model.shipping_minor_units,
        tax_minor_units: model.tax_minor_units,
        discount_minor_units: model.discount_minor_units,
        total_minor_units: model.total_minor_units,
        currency: model.currency,
        status,
        payment,
        shipping_address: model.shipping_address,
        shipping_method: model.shipping_method,
        discount_code: model.discount_code,
        idempotency_key: model.idempotency_key,
        created_at: model.created_at.with_timezone(&Utc),
        updated_at: model.updated_at.with_timezone(&Utc),
    })
}
