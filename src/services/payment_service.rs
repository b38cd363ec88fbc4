use chrono::Utc;
use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::{
    audit::log_audit,
    dto::payments::{
        CreatePaymentRequest, PaymentList, RefundPaymentRequest, UpdatePaymentRequest,
    },
    entity::{
        orders::{ActiveModel as OrderActive, Entity as Orders},
        payments::{ActiveModel as PaymentActive, Column as PaymentCol, Entity as Payments},
    },
    error::{AppError, AppResult},
    middleware::auth::{AuthUser, ensure_admin},
    models::Payment,
    response::{ApiResponse, Meta},
    routes::params::PaymentListQuery,
    state::AppState,
    status::{OrderStatus, PaymentStatus},
};

pub async fn list_payments(
    state: &AppState,
    user: &AuthUser,
    query: PaymentListQuery,
) -> AppResult<ApiResponse<PaymentList>> {
    ensure_admin(user)?;
    let (page, limit, offset) = query.pagination.normalize();

    let mut condition = Condition::all();
    if let Some(order_id) = query.order_id {
        condition = condition.add(PaymentCol::OrderId.eq(order_id));
    }
    if let Some(status) = query.status.as_ref().filter(|s| !s.is_empty()) {
        let status = PaymentStatus::parse(status)
            .ok_or_else(|| AppError::Validation("Invalid payment status".into()))?;
        condition = condition.add(PaymentCol::Status.eq(status));
    }
    if let Some(provider) = query.payment_provider.as_ref().filter(|s| !s.is_empty()) {
        condition = condition.add(PaymentCol::PaymentProvider.eq(provider.clone()));
    }

    let finder = Payments::find()
        .filter(condition)
        .order_by_desc(PaymentCol::CreatedAt);

    let total = finder.clone().count(&state.orm).await? as i64;

    let items = finder
        .limit(limit as u64)
        .offset(offset as u64)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Payment::from)
        .collect();

    let meta = Meta::new(page, limit, total);
    Ok(ApiResponse::success_with_meta(
        "Payments retrieved successfully",
        PaymentList { items },
        meta,
    ))
}

pub async fn create_payment(
    state: &AppState,
    user: &AuthUser,
    payload: CreatePaymentRequest,
) -> AppResult<ApiResponse<Payment>> {
    ensure_admin(user)?;
    if payload.payment_provider.trim().is_empty() {
        return Err(AppError::Validation(
            "payment_provider must not be empty".into(),
        ));
    }

    let order = Orders::find_by_id(payload.order_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    // Amounts are integer minor units; the comparison is exact.
    if payload.amount != order.total_amount {
        return Err(AppError::Validation(
            "Payment amount does not match order total".into(),
        ));
    }

    let payment = PaymentActive {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        status: Set(PaymentStatus::Pending),
        amount: Set(payload.amount),
        transaction_id: Set(payload.transaction_id),
        payment_provider: Set(payload.payment_provider),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "payment_create",
        Some("payments"),
        Some(serde_json::json!({ "payment_id": payment.id, "order_id": payment.order_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Payment created successfully",
        Payment::from(payment),
    ))
}

pub async fn get_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<Payment>> {
    ensure_admin(user)?;
    let payment = Payments::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Payment not found".into()))?;

    Ok(ApiResponse::success(
        "Payment retrieved successfully",
        Payment::from(payment),
    ))
}

pub async fn update_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: UpdatePaymentRequest,
) -> AppResult<ApiResponse<Payment>> {
    ensure_admin(user)?;
    let target = PaymentStatus::parse(&payload.status)
        .ok_or_else(|| AppError::Validation("Invalid payment status".into()))?;

    let payment = Payments::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Payment not found".into()))?;

    let order = Orders::find_by_id(payment.order_id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;

    // A cancelled order may not gain a successful payment; the refund flow is
    // the only way out of that pairing.
    if target == PaymentStatus::Success && order.status == OrderStatus::Cancelled {
        return Err(AppError::Transition(
            "Cannot mark a payment successful for a cancelled order".into(),
        ));
    }

    let txn = state.orm.begin().await?;

    let mut active: PaymentActive = payment.into();
    active.status = Set(target);
    if payload.transaction_id.is_some() {
        active.transaction_id = Set(payload.transaction_id);
    }
    let payment = active.update(&txn).await?;

    // Success promotes a pending order to paid; nothing ever downgrades.
    if target == PaymentStatus::Success && order.status == OrderStatus::Pending {
        let mut order_active: OrderActive = order.into();
        order_active.status = Set(OrderStatus::Paid);
        order_active.updated_at = Set(Utc::now().into());
        order_active.update(&txn).await?;
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "payment_status_update",
        Some("payments"),
        Some(serde_json::json!({ "payment_id": payment.id, "status": target.as_str() })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Payment status updated successfully",
        Payment::from(payment),
    ))
}

pub async fn delete_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<ApiResponse<serde_json::Value>> {
    ensure_admin(user)?;
    let payment = Payments::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Payment not found".into()))?;

    if !payment.status.deletable() {
        return Err(AppError::Transition(format!(
            "Cannot delete payment with status: {}",
            payment.status.as_str()
        )));
    }

    Payments::delete_by_id(payment.id).exec(&state.orm).await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "payment_delete",
        Some("payments"),
        Some(serde_json::json!({ "payment_id": id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Payment deleted successfully",
        serde_json::json!({}),
    ))
}

pub async fn refund_payment(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    payload: RefundPaymentRequest,
) -> AppResult<ApiResponse<Payment>> {
    ensure_admin(user)?;
    let payment = Payments::find_by_id(id)
        .one(&state.orm)
        .await?
        .ok_or_else(|| AppError::NotFound("Payment not found".into()))?;

    if !payment.status.refundable() {
        return Err(AppError::Transition(
            "Can only refund successful payments".into(),
        ));
    }

    let order_id = payment.order_id;
    let txn = state.orm.begin().await?;

    let mut active: PaymentActive = payment.into();
    active.status = Set(PaymentStatus::Refunded);
    if payload.transaction_id.is_some() {
        active.transaction_id = Set(payload.transaction_id);
    }
    let payment = active.update(&txn).await?;

    // Refunding a payment cancels the order it settled.
    let order = Orders::find_by_id(order_id).one(&txn).await?;
    if let Some(order) = order {
        if order.status != OrderStatus::Cancelled {
            let mut order_active: OrderActive = order.into();
            order_active.status = Set(OrderStatus::Cancelled);
            order_active.updated_at = Set(Utc::now().into());
            order_active.update(&txn).await?;
        }
    }

    txn.commit().await?;

    if let Err(err) = log_audit(
        &state.pool,
        Some(user.user_id),
        "payment_refund",
        Some("payments"),
        Some(serde_json::json!({ "payment_id": payment.id, "order_id": order_id })),
    )
    .await
    {
        tracing::warn!(error = %err, "audit log failed");
    }

    Ok(ApiResponse::success(
        "Payment refunded successfully",
        Payment::from(payment),
    ))
}

pub async fn list_by_order(
    state: &AppState,
    _user: &AuthUser,
    order_id: Uuid,
) -> AppResult<ApiResponse<PaymentList>> {
    let order = Orders::find_by_id(order_id).one(&state.orm).await?;
    if order.is_none() {
        return Err(AppError::NotFound("Order not found".into()));
    }

    let items = Payments::find()
        .filter(PaymentCol::OrderId.eq(order_id))
        .order_by_desc(PaymentCol::CreatedAt)
        .all(&state.orm)
        .await?
        .into_iter()
        .map(Payment::from)
        .collect();

    Ok(ApiResponse::success(
        "Payments retrieved successfully",
        PaymentList { items },
    ))
}
