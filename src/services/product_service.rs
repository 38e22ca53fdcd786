use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::products::{CreateProductRequest, ProductList, UpdateProductRequest},
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{NewProduct, Product, ProductChanges},
    response::{ApiResponse, Meta},
    routes::params::{ProductQuery, ProductSortBy, SortOrder},
    services::pricing::normalize_currency,
    state::AppState,
    store::{AuditEntry, ProductFilter},
};

pub async fn list_products(
    state: &AppState,
    query: ProductQuery,
) -> AppResult<ApiResponse<ProductList>> {
    let (page, limit, offset) = query.pagination().normalize();
    let filter = ProductFilter {
        search: query.q.filter(|s| !s.trim().is_empty()),
        min_price: query.min_price,
        max_price: query.max_price,
        sort_by: query.sort_by.unwrap_or(ProductSortBy::CreatedAt),
        sort_order: query.sort_order.unwrap_or(SortOrder::Desc),
        limit: limit as u64,
        offset: offset as u64,
    };

    let (items, total) = state.catalog.list(&filter).await?;

    let meta = Meta::paged(page, limit, total);
    Ok(ApiResponse::paged("Products", ProductList { items }, meta))
}

pub async fn get_product(state: &AppState, id: Uuid) -> AppResult<ApiResponse<Product>> {
    let product = state.catalog.find_by_id(id).await?.ok_or(AppError::NotFound)?;
    Ok(ApiResponse::ok("Product", product))
}

pub async fn create_product(
    state: &AppState,
    user: &AuthUser,
    payload: CreateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;

    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::BadRequest("Title is required".into()));
    }
    ensure_price(payload.price)?;
    ensure_stock(payload.stock)?;
    let currency = normalize_currency(
        payload
            .currency
            .as_deref()
            .unwrap_or(&state.checkout.default_currency),
    )?;

    let product = state
        .catalog
        .create(NewProduct {
            title,
            description: payload.description,
            price: payload.price,
            currency,
            image_url: payload.image_url,
            stock: payload.stock,
        })
        .await
        .map_err(|err| match err {
            err if err.is_conflict() => {
                AppError::Conflict("A product with this title already exists".into())
            }
            err => err.into(),
        })?;

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("product_create", "products")
            .by(Some(user.user_id))
            .with_metadata(serde_json::json!({ "productId": product.id })),
    )
    .await;

    Ok(ApiResponse::ok("Product created", product))
}

pub async fn update_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateProductRequest,
) -> AppResult<ApiResponse<Product>> {
    ensure_admin(user)?;

    if let Some(price) = payload.price {
        ensure_price(price)?;
    }
    if let Some(stock) = payload.stock {
        ensure_stock(stock)?;
    }
    let currency = payload
        .currency
        .as_deref()
        .map(normalize_currency)
        .transpose()?;

    let changes = ProductChanges {
        title: payload.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
        description: payload.description,
        price: payload.price,
        currency,
        image_url: payload.image_url,
        stock: payload.stock,
    };

    let product = state
        .catalog
        .update(id, changes)
        .await?
        .ok_or(AppError::NotFound)?;

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("product_update", "products")
            .by(Some(user.user_id))
            .with_metadata(serde_json::json!({ "productId": product.id })),
    )
    .await;

    Ok(ApiResponse::ok("Updated", product))
}

pub async fn delete_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    if !state.catalog.delete(id).await? {
        return Err(AppError::NotFound);
    }

    log_audit(
        state.audit.as_ref(),
        AuditEntry::new("product_delete", "products")
            .by(Some(user.user_id))
            .with_metadata(serde_json::json!({ "productId": id })),
    )
    .await;

    Ok(ApiResponse::ok("Deleted", serde_json::json!({})))
}

fn ensure_price(price: Decimal) -> AppResult<()> {
    if price.is_sign_negative() {
        return Err(AppError::BadRequest("Price must not be negative".into()));
    }
    Ok(())
}

fn ensure_stock(stock: i32) -> AppResult<()> {
    if stock < 0 {
        return Err(AppError::BadRequest("Stock must not be negative".into()));
    }
    Ok(())
}
