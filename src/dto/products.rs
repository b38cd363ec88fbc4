use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{Category, Product, ProductImage};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ImagePayload {
    pub url: String,
    #[serde(default)]
    pub is_primary: bool,
}

/// Image entry in a product update. With `id` it edits an existing image,
/// without it a new image is attached (then `url` is required).
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ImageUpdatePayload {
    pub id: Option<Uuid>,
    pub url: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateProductRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub discount_price: Option<i64>,
    #[serde(default)]
    pub stock_quantity: i32,
    pub is_active: Option<bool>,
    pub category_id: Uuid,
    #[serde(default)]
    pub images: Vec<ImagePayload>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateProductRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub discount_price: Option<i64>,
    pub stock_quantity: Option<i32>,
    pub is_active: Option<bool>,
    pub category_id: Option<Uuid>,
    #[serde(default)]
    pub images: Vec<ImageUpdatePayload>,
    #[serde(default)]
    pub deleted_image_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductWithImages {
    #[serde(flatten)]
    pub product: Product,
    pub images: Vec<ProductImage>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProductDetail {
    #[serde(flatten)]
    pub product: Product,
    pub images: Vec<ProductImage>,
    pub category: Category,
}

#[derive(Serialize, ToSchema)]
#[serde(transparent)]
pub struct ProductList {
    #[schema(value_type = Vec<ProductWithImages>)]
    pub items: Vec<ProductWithImages>,
}
