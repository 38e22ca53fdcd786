use utoipa::{
    Modify, OpenApi,
    openapi::{
        self,
        OpenApi as OpenApiSpec,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};
use utoipa_scalar::{Scalar, Servable};

use crate::{
    dto::{
        auth::{AuthResponse, LoginRequest, RegisterRequest},
        checkout::{CheckoutItem, CheckoutRequest, CheckoutResponse},
        orders::OrderList,
        products::{CreateProductRequest, ProductList, UpdateProductRequest},
        users::{ChangePasswordRequest, ResetPasswordRequest, UpdateProfileRequest, UserList},
        webhooks::WebhookAck,
    },
    models::{Order, OrderItem, OrderStatus, Payment, Product, User},
    response::{ApiResponse, Meta},
    routes::{auth, checkout, health, orders, params, products, users, webhooks},
};

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health_check,
        auth::login,
        auth::register,
        users::get_profile,
        users::update_profile,
        users::change_password,
        users::list_users,
        users::get_user,
        users::reset_password,
        users::delete_user,
        products::list_products,
        products::create_product,
        products::get_product,
        products::update_product,
        products::delete_product,
        orders::list_orders,
        orders::get_order,
        checkout::create_checkout,
        webhooks::stripe_webhook
    ),
    components(
        schemas(
            User,
            Product,
            Order,
            OrderItem,
            OrderStatus,
            Payment,
            RegisterRequest,
            LoginRequest,
            AuthResponse,
            UpdateProfileRequest,
            ChangePasswordRequest,
            ResetPasswordRequest,
            UserList,
            CreateProductRequest,
            UpdateProductRequest,
            ProductList,
            OrderList,
            CheckoutItem,
            CheckoutRequest,
            CheckoutResponse,
            WebhookAck,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            params::SortOrder,
            params::ProductSortBy,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<Order>,
            ApiResponse<OrderList>,
            ApiResponse<AuthResponse>,
            ApiResponse<User>,
            ApiResponse<UserList>,
            ApiResponse<CheckoutResponse>
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Products", description = "Catalog endpoints"),
        (name = "Orders", description = "Order endpoints"),
        (name = "Checkout", description = "Checkout endpoint"),
        (name = "Webhooks", description = "Payment provider notifications"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Users", description = "Account endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
