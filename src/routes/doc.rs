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
        cart::{AddCartItemRequest, CartItemView, CartView, UpdateCartItemRequest},
        categories::{CategoryList, CategoryWithProducts, CreateCategoryRequest, UpdateCategoryRequest},
        orders::{
            CreateOrderRequest, OrderItemPayload, OrderItemView, OrderList, OrderView,
            UpdateOrderItemRequest, UpdateOrderStatusRequest,
        },
        payments::{CreatePaymentRequest, PaymentList, RefundPaymentRequest, UpdatePaymentRequest},
        products::{
            CreateProductRequest, ImagePayload, ImageUpdatePayload, ProductDetail, ProductList,
            ProductWithImages, UpdateProductRequest,
        },
    },
    models::{Cart, CartItem, Category, Order, OrderItem, Payment, Product, ProductImage, User},
    response::{ApiResponse, Meta},
    routes::{auth, cart, categories, health, orders, params, payments, products},
    status::{OrderStatus, PaymentMethod, PaymentStatus},
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
        categories::list_categories,
        categories::create_category,
        categories::get_category,
        categories::update_category,
        categories::delete_category,
        products::list_products,
        products::search_products,
        products::create_product,
        products::get_product,
        products::update_product,
        products::delete_product,
        cart::get_cart,
        cart::add_item,
        cart::update_item,
        cart::remove_item,
        cart::clear_cart,
        cart::delete_cart,
        orders::list_orders,
        orders::create_order,
        orders::get_order,
        orders::update_status,
        orders::cancel_order,
        orders::delete_order,
        orders::update_item,
        orders::remove_item,
        orders::list_order_payments,
        payments::list_payments,
        payments::create_payment,
        payments::get_payment,
        payments::update_payment,
        payments::delete_payment,
        payments::refund_payment
    ),
    components(
        schemas(
            User,
            Category,
            Product,
            ProductImage,
            Cart,
            CartItem,
            Order,
            OrderItem,
            Payment,
            OrderStatus,
            PaymentStatus,
            PaymentMethod,
            CreateCategoryRequest,
            UpdateCategoryRequest,
            CategoryList,
            CategoryWithProducts,
            ImagePayload,
            ImageUpdatePayload,
            CreateProductRequest,
            UpdateProductRequest,
            ProductWithImages,
            ProductDetail,
            ProductList,
            AddCartItemRequest,
            UpdateCartItemRequest,
            CartItemView,
            CartView,
            OrderItemPayload,
            CreateOrderRequest,
            UpdateOrderStatusRequest,
            UpdateOrderItemRequest,
            OrderItemView,
            OrderView,
            OrderList,
            CreatePaymentRequest,
            UpdatePaymentRequest,
            RefundPaymentRequest,
            PaymentList,
            params::Pagination,
            params::ProductQuery,
            params::OrderListQuery,
            params::PaymentListQuery,
            Meta,
            ApiResponse<Product>,
            ApiResponse<ProductList>,
            ApiResponse<CartView>,
            ApiResponse<OrderView>,
            ApiResponse<OrderList>,
            ApiResponse<Payment>,
            ApiResponse<PaymentList>
        )
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check endpoint"),
        (name = "Auth", description = "Authentication endpoints"),
        (name = "Categories", description = "Category endpoints"),
        (name = "Products", description = "Product and image endpoints"),
        (name = "Cart", description = "Cart endpoints"),
        (name = "Orders", description = "Order lifecycle endpoints"),
        (name = "Payments", description = "Payment endpoints"),
    )
)]
pub struct ApiDoc;

pub fn scalar_docs() -> Scalar<OpenApiSpec> {
    Scalar::with_url("/docs", ApiDoc::openapi())
}
