use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::sea_query::Expr;
use sea_orm::sea_query::extension::postgres::PgExpr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::products::{
        CreateProductRequest, ImagePayload, ProductDetail, ProductList, ProductWithImages,
        UpdateProductRequest,
    },
    entity::{
        categories::Entity as Categories,
        product_images::{
            ActiveModel as ImageActive, Column as ImageCol, Entity as ProductImages,
            Model as ImageModel,
        },
        products::{ActiveModel as ProductActive, Column as ProdCol, Entity as Products},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::{Category, Product, ProductImage},
    response::{ApiResponse, Meta},
    routes::params::{ProductQuery, ProductSortBy, SortOrder},
    state::AppState,
};

pub async fn list_products(
    state: &AppState,
    user: &AuthUser,
    query: ProductQuery,
) -> AppResult<ApiResponse<ProductList>> {
    ensure_admin(user)?;
    let (page, limit, offset) = query.pagination.normalize();
    let mut condition = Condition::all();

    if let Some(search) = query.q.as_ref().filter(|s| !s.is_empty()) {
        let pattern = format!("%{}%", search);
        condition = condition.add(
            Condition::any()
                .add(Expr::col(ProdCol::Name).ilike(pattern.clone()))
                .add(Expr::col(ProdCol::Description).ilike(pattern)),
        );
    }

    if let Some(category_id) = query.category_id {
        condition = condition.add(ProdCol::CategoryId.eq(category_id));
    }

    if let Some(min_price) = query.min_price {
        condition = condition.add(ProdCol::Price.gte(min_price));
    }

    if let Some(max_price) = query.max_price {
        condition = condition.add(ProdCol::Price.lte(max_price));
    }

    if let Some(is_active) = query.is_active {
        condition = condition.add(ProdCol::IsActive.eq(is_active));
    }

    let sort_by = query.sort_by.unwrap_or(ProductSortBy::CreatedAt);
    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let sort_col = match sort_by {
        ProductSortBy::CreatedAt => ProdCol::CreatedAt,
        ProductSortBy::Price => ProdCol::Price,
        ProductSortBy::Name => ProdCol::Name,
    };

    let mut finder = Products::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(sort_col),
        SortOrder::Desc => finder.order_by_desc(sort_col),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let products = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let mut items = Vec::with_capacity(products.len());
    for product in products {
        let images = load_images(&state.orm, product.id).await?;
        items.push(ProductWithImages {
            product: Product::from(product),
            images,
        });
    }

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success_with_meta(
        "Products retrieved successfully",
        ProductList { items },
        meta,
    ))
}

pub async fn get_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<ProductDetail>> {
    ensure_admin(user)?;
    let product = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Product not found".into()))?;

    let category = Categories::find_by_id(product.category_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Category not found".into()))?;

    let images = load_images(&state.orm, product.id).await?;

    Ok(ApiResponse::success(
        "Product retrieved successfully",
        ProductDetail {
            product: Product::from(product),
            images,
            category: Category::from(category),
        },
    ))
}

pub async fn create_product(
    state: &AppState,
    user: &AuthUser,
    payload: CreateProductRequest,
) -> AppResult<ApiResponse<ProductWithImages>> {
    ensure_admin(user)?;
    validate_pricing(payload.price, payload.discount_price)?;
    if payload.stock_quantity < 0 {
        return Err(AppError::Validation(
            "stock_quantity must not be negative".into(),
        ));
    }

    let category = Categories::find_by_id(payload.category_id)
        .one(&state.orm)
        .await?;
    if category.is_none() {
        return Err(AppError::Validation("Category not found".into()));
    }

    let mut images = payload.images;
    normalize_primary_flags(&mut images);

    let txn = state.orm.begin().await?;

    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        category_id: Set(payload.category_id),
        name: Set(payload.name),
        description: Set(payload.description),
        price: Set(payload.price),
        discount_price: Set(payload.discount_price),
        stock_quantity: Set(payload.stock_quantity),
        is_active: Set(payload.is_active.unwrap_or(true)),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    for (index, image) in images.iter().enumerate() {
        ImageActive {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            url: Set(image.url.clone()),
            is_primary: Set(image.is_primary),
            sort_order: Set(index as i32),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
    }

    txn.commit().await?;

    let images = load_images(&state.orm, product.id).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "product_create",
        Some("products"),
        Some(serde_json::json!({ "product_id": product.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Product created successfully",
        ProductWithImages {
            product: Product::from(product),
            images,
        },
    ))
}

pub async fn update_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateProductRequest,
) -> AppResult<ApiResponse<ProductWithImages>> {
    ensure_admin(user)?;
    let existing = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Product not found".into()))?;

    let price = payload.price.unwrap_or(existing.price);
    let discount_price = payload.discount_price.or(existing.discount_price);
    validate_pricing(price, discount_price)?;

    if let Some(stock) = payload.stock_quantity {
        if stock < 0 {
            return Err(AppError::Validation(
                "stock_quantity must not be negative".into(),
            ));
        }
    }

    if let Some(category_id) = payload.category_id {
        let category = Categories::find_by_id(category_id).one(&state.orm).await?;
        if category.is_none() {
            return Err(AppError::Validation("Category not found".into()));
        }
    }

    let current_images = ProductImages::find()
        .filter(ImageCol::ProductId.eq(id))
        .order_by_asc(ImageCol::SortOrder)
        .all(&state.orm)
        .await?;

    // Every referenced image id must belong to this product.
    for deleted_id in &payload.deleted_image_ids {
        if !current_images.iter().any(|img| img.id == *deleted_id) {
            return Err(AppError::Validation(
                "deleted_image_ids references an image of another product".into(),
            ));
        }
    }
    for entry_id in payload.images.iter().filter_map(|e| e.id) {
        if !current_images.iter().any(|img| img.id == entry_id) {
            return Err(AppError::Validation(
                "images references an image of another product".into(),
            ));
        }
    }

    let additions: Vec<&crate::dto::products::ImageUpdatePayload> =
        payload.images.iter().filter(|e| e.id.is_none()).collect();
    for addition in &additions {
        if addition.url.as_deref().unwrap_or("").is_empty() {
            return Err(AppError::Validation("new images require a url".into()));
        }
    }

    let remaining = current_images
        .iter()
        .filter(|img| !payload.deleted_image_ids.contains(&img.id))
        .count();
    if !current_images.is_empty() && remaining == 0 && additions.is_empty() {
        return Err(AppError::Validation(
            "Cannot delete all images. A product must have at least one image.".into(),
        ));
    }

    let txn = state.orm.begin().await?;

    let mut active: ProductActive = existing.into();
    if let Some(name) = payload.name.clone() {
        active.name = Set(name);
    }
    if let Some(description) = payload.description.clone() {
        active.description = Set(Some(description));
    }
    if let Some(price) = payload.price {
        active.price = Set(price);
    }
    if payload.discount_price.is_some() {
        active.discount_price = Set(payload.discount_price);
    }
    if let Some(stock) = payload.stock_quantity {
        active.stock_quantity = Set(stock);
    }
    if let Some(is_active) = payload.is_active {
        active.is_active = Set(is_active);
    }
    if let Some(category_id) = payload.category_id {
        active.category_id = Set(category_id);
    }
    active.updated_at = Set(Utc::now().into());
    let product = active.update(&txn).await?;

    if !payload.deleted_image_ids.is_empty() {
        ProductImages::delete_many()
            .filter(ImageCol::Id.is_in(payload.deleted_image_ids.clone()))
            .exec(&txn)
            .await?;
    }

    // The first payload entry flagged primary wins; later flags are ignored.
    let mut designated: Option<Uuid> = None;

    let mut next_sort = current_images
        .iter()
        .map(|img| img.sort_order)
        .max()
        .map(|s| s + 1)
        .unwrap_or(0);

    for entry in &payload.images {
        match entry.id {
            Some(image_id) => {
                if payload.deleted_image_ids.contains(&image_id) {
                    continue;
                }
                if let Some(url) = entry.url.clone() {
                    let Some(model) = current_images.iter().find(|img| img.id == image_id) else {
                        continue;
                    };
                    let mut image: ImageActive = model.clone().into();
                    image.url = Set(url);
                    image.update(&txn).await?;
                }
                if entry.is_primary && designated.is_none() {
                    designated = Some(image_id);
                }
            }
            None => {
                let inserted = ImageActive {
                    id: Set(Uuid::new_v4()),
                    product_id: Set(product.id),
                    url: Set(entry.url.clone().unwrap_or_default()),
                    is_primary: Set(false),
                    sort_order: Set(next_sort),
                    created_at: NotSet,
                }
                .insert(&txn)
                .await?;
                next_sort += 1;
                if entry.is_primary && designated.is_none() {
                    designated = Some(inserted.id);
                }
            }
        }
    }

    ensure_single_primary(&txn, product.id, designated).await?;

    txn.commit().await?;

    let images = load_images(&state.orm, product.id).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "product_update",
        Some("products"),
        Some(serde_json::json!({ "product_id": product.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Product updated successfully",
        ProductWithImages {
            product: Product::from(product),
            images,
        },
    ))
}

pub async fn delete_product(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    let result = Products::delete_by_id(id).exec(&state.orm).await?;

    if result.rows_affected == 0 {
        return Err(AppError::NotFound("Product not found".into()));
    }

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "product_delete",
        Some("products"),
        Some(serde_json::json!({ "product_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Product deleted successfully",
        serde_json::json!({}),
    ))
}

pub(crate) async fn load_images<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> AppResult<Vec<ProductImage>> {
    let images = ProductImages::find()
        .filter(ImageCol::ProductId.eq(product_id))
        .order_by_asc(ImageCol::SortOrder)
        .all(conn)
        .await?
        .into_iter()
        .map(ProductImage::from)
        .collect();
    Ok(images)
}

fn validate_pricing(price: i64, discount_price: Option<i64>) -> AppResult<()> {
    if price < 0 {
        return Err(AppError::Validation("price must not be negative".into()));
    }
    if let Some(discount) = discount_price {
        if discount < 0 {
            return Err(AppError::Validation(
                "discount_price must not be negative".into(),
            ));
        }
        if discount >= price {
            return Err(AppError::Validation(
                "Discount price must be less than the regular price".into(),
            ));
        }
    }
    Ok(())
}

/// Keep exactly one primary flag: the first payload entry designated primary
/// wins; with no designation the first supplied image becomes primary.
fn normalize_primary_flags(images: &mut [ImagePayload]) {
    let mut primary_seen = false;
    for image in images.iter_mut() {
        if image.is_primary {
            if primary_seen {
                image.is_primary = false;
            } else {
                primary_seen = true;
            }
        }
    }
    if !primary_seen {
        if let Some(first) = images.first_mut() {
            first.is_primary = true;
        }
    }
}

/// Re-establish the one-primary invariant after image mutations. `designated`
/// names the image the caller picked; otherwise an existing primary is kept
/// and the first image (lowest sort_order) is promoted as a fallback.
async fn ensure_single_primary<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    designated: Option<Uuid>,
) -> AppResult<()> {
    let images = ProductImages::find()
        .filter(ImageCol::ProductId.eq(product_id))
        .order_by_asc(ImageCol::SortOrder)
        .all(conn)
        .await?;
    if images.is_empty() {
        return Ok(());
    }

    let keep = designated
        .filter(|id| images.iter().any(|img| img.id == *id))
        .or_else(|| images.iter().find(|img| img.is_primary).map(|img| img.id))
        .unwrap_or(images[0].id);

    for image in images {
        let should_be_primary = image.id == keep;
        if image.is_primary != should_be_primary {
            set_primary(conn, image, should_be_primary).await?;
        }
    }
    Ok(())
}

async fn set_primary<C: ConnectionTrait>(
    conn: &C,
    image: ImageModel,
    is_primary: bool,
) -> AppResult<()> {
    let mut active: ImageActive = image.into();
    active.is_primary = Set(is_primary);
    active.update(conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(url: &str, is_primary: bool) -> ImagePayload {
        ImagePayload {
            url: url.to_string(),
            is_primary,
        }
    }

    #[test]
    fn first_supplied_image_becomes_primary_by_default() {
        let mut images = vec![image("a", false), image("b", false)];
        normalize_primary_flags(&mut images);
        assert!(images[0].is_primary);
        assert!(!images[1].is_primary);
    }

    #[test]
    fn first_designated_primary_wins() {
        let mut images = vec![image("a", false), image("b", true), image("c", true)];
        normalize_primary_flags(&mut images);
        assert!(!images[0].is_primary);
        assert!(images[1].is_primary);
        assert!(!images[2].is_primary);
    }

    #[test]
    fn empty_image_list_is_left_alone() {
        let mut images: Vec<ImagePayload> = Vec::new();
        normalize_primary_flags(&mut images);
        assert!(images.is_empty());
    }

    #[test]
    fn discount_must_undercut_price() {
        assert!(validate_pricing(1000, None).is_ok());
        assert!(validate_pricing(1000, Some(999)).is_ok());
        assert!(validate_pricing(1000, Some(1000)).is_err());
        assert!(validate_pricing(1000, Some(1500)).is_err());
        assert!(validate_pricing(-1, None).is_err());
        assert!(validate_pricing(1000, Some(-1)).is_err());
    }
}
