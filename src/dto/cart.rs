use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Cart, CartItem, Product, ProductImage};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddCartItemRequest {
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<i32>,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateCartItemRequest {
    pub quantity: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartItemView {
    #[serde(flatten)]
    pub item: CartItem,
    pub product: Product,
    pub images: Vec<ProductImage>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartView {
    #[serde(flatten)]
    pub cart: Cart,
    pub items: Vec<CartItemView>,
}
