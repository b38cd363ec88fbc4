use std::collections::HashMap;

use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::cart::{AddCartItemRequest, CartItemView, CartView, UpdateCartItemRequest},
    entity::{
        cart_items::{ActiveModel as CartItemActive, Column as CartItemCol, Entity as CartItems},
        carts::{ActiveModel as CartActive, Column as CartCol, Entity as Carts, Model as CartModel},
        product_images::{Column as ImageCol, Entity as ProductImages},
        products::{Column as ProdCol, Entity as Products},
        users::Entity as Users,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Cart, CartItem, Product, ProductImage},
    response::ApiResponse,
    state::AppState,
};

pub async fn get_or_create_cart(
    state: &AppState,
    _user: &AuthUser,
    user_id: Uuid,
) -> AppResult<ApiResponse<CartView>> {
    let user = Users::find_by_id(user_id).one(&state.orm).await?;
    if user.is_none() {
        return Err(AppError::Validation("User not found".into()));
    }

    let cart = find_or_create_cart(&state.orm, user_id).await?;
    let view = load_cart_view(&state.orm, cart).await?;

    Ok(ApiResponse::success("Cart retrieved successfully", view))
}

pub async fn add_item(
    state: &AppState,
    user: &AuthUser,
    payload: AddCartItemRequest,
) -> AppResult<ApiResponse<CartView>> {
    if payload.quantity < 1 {
        return Err(AppError::Validation(
            "quantity must be greater than 0".into(),
        ));
    }

    let exists = Users::find_by_id(payload.user_id).one(&state.orm).await?;
    if exists.is_none() {
        return Err(AppError::Validation("User not found".into()));
    }

    let product = Products::find_by_id(payload.product_id)
        .one(&state.orm)
        .await?;
    if product.is_none() {
        return Err(AppError::Validation("Product not found".into()));
    }

    let txn = state.orm.begin().await?;

    let cart = find_or_create_cart(&txn, payload.user_id).await?;

    // A repeat add of the same (product, variant) bumps the quantity.
    let mut variant_filter = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .filter(CartItemCol::ProductId.eq(payload.product_id));
    variant_filter = match payload.variant_id {
        Some(variant_id) => variant_filter.filter(CartItemCol::VariantId.eq(variant_id)),
        None => variant_filter.filter(CartItemCol::VariantId.is_null()),
    };
    let existing = variant_filter.one(&txn).await?;

    match existing {
        Some(item) => {
            let quantity = item.quantity + payload.quantity;
            let mut active: CartItemActive = item.into();
            active.quantity = Set(quantity);
            active.update(&txn).await?;
        }
        None => {
            CartItemActive {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                product_id: Set(payload.product_id),
                variant_id: Set(payload.variant_id),
                quantity: Set(payload.quantity),
                created_at: NotSet,
            }
            .insert(&txn)
            .await?;
        }
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "cart_add_item",
        Some("cart_items"),
        Some(serde_json::json!({
            "cart_id": cart.id,
            "product_id": payload.product_id,
            "quantity": payload.quantity,
        })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_cart_view(&state.orm, cart).await?;
    Ok(ApiResponse::success("Item added to cart successfully", view))
}

pub async fn update_item(
    state: &AppState,
    _user: &AuthUser,
    cart_item_id: Uuid,
    payload: UpdateCartItemRequest,
) -> AppResult<ApiResponse<CartView>> {
    if payload.quantity < 1 {
        return Err(AppError::Validation(
            "quantity must be greater than 0".into(),
        ));
    }

    let item = CartItems::find_by_id(cart_item_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Cart item not found".into()))?;

    let cart_id = item.cart_id;
    let mut active: CartItemActive = item.into();
    active.quantity = Set(payload.quantity);
    active.update(&state.orm).await?;

    let cart = Carts::find_by_id(cart_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Cart not found".into()))?;
    let view = load_cart_view(&state.orm, cart).await?;

    Ok(ApiResponse::success("Cart item updated successfully", view))
}

pub async fn remove_item(
    state: &AppState,
    user: &AuthUser,
    cart_item_id: Uuid,
) -> AppResult<ApiResponse<CartView>> {
    let item = CartItems::find_by_id(cart_item_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Cart item not found".into()))?;

    let cart_id = item.cart_id;
    CartItems::delete_by_id(item.id).exec(&state.orm).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "cart_remove_item",
        Some("cart_items"),
        Some(serde_json::json!({ "cart_item_id": cart_item_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let cart = Carts::find_by_id(cart_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Cart not found".into()))?;
    let view = load_cart_view(&state.orm, cart).await?;

    Ok(ApiResponse::success(
        "Item removed from cart successfully",
        view,
    ))
}

pub async fn clear_cart(
    state: &AppState,
    _user: &AuthUser,
    cart_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let cart = Carts::find_by_id(cart_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Cart not found".into()))?;

    CartItems::delete_many()
        .filter(CartItemCol::CartId.eq(cart.id))
        .exec(&state.orm)
        .await?;

    Ok(ApiResponse::success(
        "Cart cleared successfully",
        serde_json::json!({}),
    ))
}

pub async fn delete_cart(
    state: &AppState,
    _user: &AuthUser,
    cart_id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let result = Carts::delete_by_id(cart_id).exec(&state.orm).await?;
    if result.rows_affected == 0 {
        return Err(AppError::NotFound("Cart not found".into()));
    }

    Ok(ApiResponse::success(
        "Cart deleted successfully",
        serde_json::json!({}),
    ))
}

async fn find_or_create_cart<C: ConnectionTrait>(conn: &C, user_id: Uuid) -> AppResult<CartModel> {
    let cart = Carts::find()
        .filter(CartCol::UserId.eq(user_id))
        .one(conn)
        .await?;
    match cart {
        Some(cart) => Ok(cart),
        None => {
            let cart = CartActive {
                id: Set(Uuid::new_v4()),
                user_id: Set(user_id),
                created_at: NotSet,
            }
            .insert(conn)
            .await?;
            Ok(cart)
        }
    }
}

/// Hydrate the cart the way clients consume it: items with their product and
/// the product's images, loaded in three queries.
pub(crate) async fn load_cart_view<C: ConnectionTrait>(
    conn: &C,
    cart: CartModel,
) -> AppResult<CartView> {
    let items = CartItems::find()
        .filter(CartItemCol::CartId.eq(cart.id))
        .order_by_asc(CartItemCol::CreatedAt)
        .all(conn)
        .await?;

    let product_ids: Vec<Uuid> = items.iter().map(|item| item.product_id).collect();

    let mut products: HashMap<Uuid, Product> = HashMap::new();
    let mut images: HashMap<Uuid, Vec<ProductImage>> = HashMap::new();
    if !product_ids.is_empty() {
        for product in Products::find()
            .filter(ProdCol::Id.is_in(product_ids.clone()))
            .all(conn)
            .await?
        {
            products.insert(product.id, Product::from(product));
        }
        for image in ProductImages::find()
            .filter(ImageCol::ProductId.is_in(product_ids))
            .order_by_asc(ImageCol::SortOrder)
            .all(conn)
            .await?
        {
            images
                .entry(image.product_id)
                .or_default()
                .push(ProductImage::from(image));
        }
    }

    let mut views = Vec::with_capacity(items.len());
    for item in items {
        let Some(product) = products.get(&item.product_id).cloned() else {
            continue;
        };
        let product_images = images.get(&item.product_id).cloned().unwrap_or_default();
        views.push(CartItemView {
            item: CartItem::from(item),
            product,
            images: product_images,
        });
    }

    Ok(CartView {
        cart: Cart::from(cart),
        items: views,
    })
}
