use std::collections::HashMap;

use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::orders::{
        CreateOrderRequest, OrderItemView, OrderList, OrderView, UpdateOrderItemRequest,
        UpdateOrderStatusRequest,
    },
    entity::{
        cart_items::{Column as CartItemCol, Entity as CartItems},
        carts::Entity as Carts,
        order_items::{
            ActiveModel as OrderItemActive, Column as OrderItemCol, Entity as OrderItems,
        },
        orders::{
            ActiveModel as OrderActive, Column as OrderCol, Entity as Orders, Model as OrderModel,
        },
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments},
        product_images::{Column as ImageCol, Entity as ProductImages},
        products::{Column as ProdCol, Entity as Products},
        users::Entity as Users,
    },
    error::{AppError, AppResult},
    middleware::auth::AuthUser,
    models::{Order, OrderItem, Product, ProductImage},
    response::{ApiResponse, Meta},
    routes::params::{OrderListQuery, SortOrder},
    state::AppState,
    status::{OrderStatus, PaymentStatus},
};

pub async fn list_orders(
    state: &AppState,
    _user: &AuthUser,
    query: OrderListQuery,
) -> AppResult<ApiResponse<OrderList>> {
    let (page, limit, offset) = query.pagination.normalize();

    let mut condition = Condition::all();
    if let Some(user_id) = query.user_id {
        condition = condition.add(OrderCol::UserId.eq(user_id));
    }
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        let status = OrderStatus::parse(status)
            .ok_or_else(|| AppError::Validation("Invalid order status".into()))?;
        condition = condition.add(OrderCol::Status.eq(status));
    }

    let sort_order = query.sort_order.unwrap_or(SortOrder::Desc);
    let mut finder = Orders::find().filter(condition);
    finder = match sort_order {
        SortOrder::Asc => finder.order_by_asc(OrderCol::CreatedAt),
        SortOrder::Desc => finder.order_by_desc(OrderCol::CreatedAt),
    };

    let total = finder.clone().count(&state.orm).await? as i64;

    let orders = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?;

    let mut items = Vec::with_capacity(orders.len());
    for order in orders {
        items.push(load_order_view(&state.orm, order).await?);
    }

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success_with_meta(
        "Orders retrieved successfully",
        OrderList { items },
        meta,
    ))
}

pub async fn create_order(
    state: &AppState,
    user: &AuthUser,
    payload: CreateOrderRequest,
) -> AppResult<ApiResponse<OrderView>> {
    if payload.items.is_empty() {
        return Err(AppError::Validation("items must not be empty".into()));
    }
    for item in &payload.items {
        if item.quantity < 1 {
            return Err(AppError::Validation(
                "item quantity must be greater than 0".into(),
            ));
        }
    }

    let exists = Users::find_by_id(payload.user_id).one(&state.orm).await?;
    if exists.is_none() {
        return Err(AppError::Validation("User not found".into()));
    }

    let txn = state.orm.begin().await?;

    // Resolve every product before writing anything. A missing product fails
    // the whole creation; the dropped transaction rolls back.
    let mut total_amount: i64 = 0;
    let mut snapshots = Vec::with_capacity(payload.items.len());
    for item in &payload.items {
        let product = Products::find_by_id(item.product_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Product not found: {}", item.product_id))
            })?;
        let price_at_purchase = product.price;
        total_amount += price_at_purchase * item.quantity as i64;
        snapshots.push((item.clone(), price_at_purchase));
    }

    let order = OrderActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(payload.user_id),
        status: Set(OrderStatus::Pending),
        total_amount: Set(total_amount),
        payment_method: Set(payload.payment_method),
        email: Set(payload.email),
        first_name: Set(payload.first_name),
        last_name: Set(payload.last_name),
        address: Set(payload.address),
        city: Set(payload.city),
        state: Set(payload.state),
        zip_code: Set(payload.zip_code),
        phone: Set(payload.phone),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&txn)
    .await?;

    for (item, price_at_purchase) in snapshots {
        OrderItemActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            product_id: Set(item.product_id),
            variant_id: Set(item.variant_id),
            quantity: Set(item.quantity),
            price_at_purchase: Set(price_at_purchase),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
    }

    if let Some(cart_id) = payload.from_cart_id {
        let cart = Carts::find_by_id(cart_id).one(&txn).await?;
        if let Some(cart) = cart {
            CartItems::delete_many()
                .filter(CartItemCol::CartId.eq(cart.id))
                .exec(&txn)
                .await?;
        }
    }

    // Cash on delivery gets its payment record up front, in the same
    // transaction as the order.
    if order.payment_method.is_cod() {
        PaymentActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            status: Set(PaymentStatus::Pending),
            amount: Set(order.total_amount),
            transaction_id: Set(None),
            payment_provider: Set("cod".into()),
            created_at: NotSet,
        }
        .insert(&txn)
        .await?;
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_create",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "total_amount": order.total_amount })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_order_view(&state.orm, order).await?;
    Ok(ApiResponse::success("Order created successfully", view))
}

pub async fn get_order(
    state: &AppState,
    _user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderView>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    let view = load_order_view(&state.orm, order).await?;
    Ok(ApiResponse::success("Order retrieved successfully", view))
}

pub async fn update_status(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdateOrderStatusRequest,
) -> AppResult<ApiResponse<OrderView>> {
    let target = OrderStatus::parse(&payload.status)
        .ok_or_else(|| AppError::Validation("Invalid order status".into()))?;

    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    let txn = state.orm.begin().await?;

    let mut active: OrderActive = order.into();
    active.status = Set(target);
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    sync_payments(&txn, &order, target).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_status_update",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id, "status": target.as_str() })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_order_view(&state.orm, order).await?;
    Ok(ApiResponse::success("Order status updated successfully", view))
}

pub async fn cancel_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<OrderView>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    if !order.status.cancellable() {
        return Err(AppError::Transition(format!(
            "Cannot cancel order with status: {}",
            order.status.as_str()
        )));
    }

    let txn = state.orm.begin().await?;

    let mut active: OrderActive = order.into();
    active.status = Set(OrderStatus::Cancelled);
    active.updated_at = Set(Utc::now().into());
    let order = active.update(&txn).await?;

    sync_payments(&txn, &order, OrderStatus::Cancelled).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_cancel",
        Some("orders"),
        Some(serde_json::json!({ "order_id": order.id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_order_view(&state.orm, order).await?;
    Ok(ApiResponse::success("Order cancelled successfully", view))
}

pub async fn delete_order(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    let order = Orders::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    if !order.status.deletable() {
        return Err(AppError::Transition(format!(
            "Cannot delete order with status: {}",
            order.status.as_str()
        )));
    }

    Orders::delete_by_id(order.id).exec(&state.orm).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_delete",
        Some("orders"),
        Some(serde_json::json!({ "order_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Order deleted successfully",
        serde_json::json!({}),
    ))
}

pub async fn update_item(
    state: &AppState,
    user: &AuthUser,
    order_id: Uuid,
    item_id: Uuid,
    payload: UpdateOrderItemRequest,
) -> AppResult<ApiResponse<OrderView>> {
    if payload.quantity < 1 {
        return Err(AppError::Validation(
            "quantity must be greater than 0".into(),
        ));
    }

    let order = Orders::find_by_id(order_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    if !order.status.items_mutable() {
        return Err(AppError::Transition(
            "Only pending orders can be modified".into(),
        ));
    }

    let item = OrderItems::find_by_id(item_id)
        .one(&state.orm)
        .await?
        .filter(|item| item.order_id == order.id)
        .ok_or_else(|| AppError::NotFound("Order item not found".into()))?;

    let txn = state.orm.begin().await?;

    let mut active: OrderItemActive = item.into();
    active.quantity = Set(payload.quantity);
    active.update(&txn).await?;

    let order = apply_recomputed_total(&txn, order).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_item_update",
        Some("order_items"),
        Some(serde_json::json!({ "order_id": order_id, "order_item_id": item_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_order_view(&state.orm, order).await?;
    Ok(ApiResponse::success("Order item updated successfully", view))
}

pub async fn remove_item(
    state: &AppState,
    user: &AuthUser,
    order_id: Uuid,
    item_id: Uuid,
) -> AppResult<ApiResponse<OrderView>> {
    let order = Orders::find_by_id(order_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    if !order.status.items_mutable() {
        return Err(AppError::Transition(
            "Only pending orders can be modified".into(),
        ));
    }

    let item = OrderItems::find_by_id(item_id)
        .one(&state.orm)
        .await?
        .filter(|item| item.order_id == order.id)
        .ok_or_else(|| AppError::NotFound("Order item not found".into()))?;

    let txn = state.orm.begin().await?;

    OrderItems::delete_by_id(item.id).exec(&txn).await?;

    let order = apply_recomputed_total(&txn, order).await?;

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "order_item_remove",
        Some("order_items"),
        Some(serde_json::json!({ "order_id": order_id, "order_item_id": item_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    let view = load_order_view(&state.orm, order).await?;
    Ok(ApiResponse::success("Order item removed successfully", view))
}

/// Keep the payment records of an order consistent with a status change.
/// Runs inside the order's transaction; used by both the generic status
/// update and the cancel endpoint.
async fn sync_payments<C: ConnectionTrait>(
    conn: &C,
    order: &OrderModel,
    target: OrderStatus,
) -> AppResult<()> {
    let payments = Payments::find()
        .filter(PaymentCol::OrderId.eq(order.id))
        .all(conn)
        .await?;

    // A cancelled order must never keep a bare successful payment; record the
    // refund regardless of payment method.
    if target == OrderStatus::Cancelled {
        for payment in payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Success)
        {
            let mut active: PaymentActive = payment.clone().into();
            active.status = Set(PaymentStatus::Refunded);
            active.update(conn).await?;
        }
    }

    if !order.payment_method.is_cod() {
        return Ok(());
    }

    if payments.is_empty() {
        let status = match target {
            OrderStatus::Delivered => PaymentStatus::Success,
            OrderStatus::Cancelled => PaymentStatus::Failed,
            _ => PaymentStatus::Pending,
        };
        PaymentActive {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            status: Set(status),
            amount: Set(order.total_amount),
            transaction_id: Set(None),
            payment_provider: Set("cod".into()),
            created_at: NotSet,
        }
        .insert(conn)
        .await?;
        return Ok(());
    }

    match target {
        OrderStatus::Delivered => {
            // Cash was collected at the door.
            for payment in payments {
                if payment.status != PaymentStatus::Success {
                    let mut active: PaymentActive = payment.into();
                    active.status = Set(PaymentStatus::Success);
                    active.update(conn).await?;
                }
            }
        }
        OrderStatus::Cancelled => {
            for payment in payments {
                if payment.status == PaymentStatus::Pending {
                    let mut active: PaymentActive = payment.into();
                    active.status = Set(PaymentStatus::Failed);
                    active.update(conn).await?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

/// Recompute total_amount from the snapshot prices of the current item set.
async fn apply_recomputed_total<C: ConnectionTrait>(
    conn: &C,
    order: OrderModel,
) -> AppResult<OrderModel> {
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .all(conn)
        .await?;
    let total_amount: i64 = items
        .iter()
        .map(|item| item.quantity as i64 * item.price_at_purchase)
        .sum();

    let mut active: OrderActive = order.into();
    active.total_amount = Set(total_amount);
    active.updated_at = Set(Utc::now().into());
    let order = active.update(conn).await?;
    Ok(order)
}

/// Hydrate an order with its items, each item's product and that product's
/// images, in three queries.
pub(crate) async fn load_order_view<C: ConnectionTrait>(
    conn: &C,
    order: OrderModel,
) -> AppResult<OrderView> {
    let items = OrderItems::find()
        .filter(OrderItemCol::OrderId.eq(order.id))
        .order_by_asc(OrderItemCol::CreatedAt)
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
        views.push(OrderItemView {
            item: OrderItem::from(item),
            product,
            images: product_images,
        });
    }

    Ok(OrderView {
        order: Order::from(order),
        items: views,
    })
}
