use uuid::Uuid;

use crate::{
    dto::orders::OrderList,
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::Order,
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
    store::OrderFilter,
};

pub async fn list_orders(
    state: &AppState,
    user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination().normalize();
    let filter = OrderFilter {
        status: query.status,
        sort_order: query.sort_order.unwrap_or(SortOrder::Desc),
        limit: limit as u64,
        offset: offset as u64,
    };

    let (items, total) = state.orders.list_for_user(user.user_id, &filter).await?;

    let meta = Meta::paged(page, limit, total);
    Ok(ApiResponse::paged("Ok", OrderList { items }, meta))
}

/// Orders are visible to their owner and to admins; anyone else gets a 404.
pub async fn get_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Order>> {
    let order = state.orders.find_by_id(id).await?.ok_or(AppError::NotFound)?;
    if order.user_id != Some(user.user_id) && !user.is_admin() {
        return Err(AppError::NotFound);
    }
    Ok(ApiResponse::ok("Ok", order))
}
