use axum_storefront_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::orders::{CreateOrderRequest, OrderItemPayload, UpdateOrderItemRequest, UpdateOrderStatusRequest},
    dto::payments::{CreatePaymentRequest, RefundPaymentRequest, UpdatePaymentRequest},
    entity::{
        categories::ActiveModel as CategoryActive, products::ActiveModel as ProductActive,
        users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    services::{order_service, payment_service},
    state::AppState,
    status::{OrderStatus, PaymentMethod, PaymentStatus},
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set, Statement};
use uuid::Uuid;

// Integration tests hit a real database; they skip themselves when no
// connection string is configured.
async fn setup_state() -> anyhow::Result<Option<AppState>> {
    let database_url =
        match std::env::var("TEST_DATABASE_URL").or_else(|_| std::env::var("DATABASE_URL")) {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run integration tests."
                );
                return Ok(None);
            }
        };

    let orm = create_orm_conn(&database_url).await?;
    let backend = orm.get_database_backend();
    // Serialize migration runs across concurrently running test binaries.
    orm.execute(Statement::from_string(
        backend,
        "SELECT pg_advisory_lock(420042)",
    ))
    .await?;
    let migrated = run_migrations(&orm).await;
    orm.execute(Statement::from_string(
        backend,
        "SELECT pg_advisory_unlock(420042)",
    ))
    .await?;
    migrated?;

    let pool = create_pool(&database_url).await?;
    Ok(Some(AppState { pool, orm }))
}

async fn create_user(state: &AppState, role: &str) -> anyhow::Result<Uuid> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(format!("{}@example.com", Uuid::new_v4())),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(user.id)
}

async fn create_category(state: &AppState) -> anyhow::Result<Uuid> {
    let category = CategoryActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("Category {}", Uuid::new_v4())),
        description: Set(None),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(category.id)
}

async fn create_product(state: &AppState, category_id: Uuid, price: i64) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        category_id: Set(category_id),
        name: Set(format!("Product {}", Uuid::new_v4())),
        description: Set(Some("A product for testing".into())),
        price: Set(price),
        discount_price: Set(None),
        stock_quantity: Set(10),
        is_active: Set(true),
        created_at: NotSet,
        updated_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(product.id)
}

fn order_request(user_id: Uuid, method: PaymentMethod, items: Vec<OrderItemPayload>) -> CreateOrderRequest {
    CreateOrderRequest {
        user_id,
        payment_method: method,
        items,
        email: "buyer@example.com".into(),
        first_name: "Test".into(),
        last_name: "Buyer".into(),
        address: "1 Main St".into(),
        city: "Springfield".into(),
        state: "OR".into(),
        zip_code: "97477".into(),
        phone: "555-0100".into(),
        from_cart_id: None,
    }
}

fn admin(user_id: Uuid) -> AuthUser {
    AuthUser {
        user_id,
        role: "admin".into(),
    }
}

#[tokio::test]
async fn cod_order_creates_pending_payment_and_delivery_marks_it_success() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let admin_id = create_user(&state, "admin").await?;
    let auth = admin(admin_id);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let resp = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Cod,
            vec![OrderItemPayload {
                product_id: product,
                variant_id: None,
                quantity: 2,
            }],
        ),
    )
    .await?;
    let order = resp.data.unwrap();
    assert_eq!(order.order.total_amount, 2000);
    assert_eq!(order.order.status, OrderStatus::Pending);

    let payments = payment_service::list_by_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(payments.items.len(), 1);
    assert_eq!(payments.items[0].status, PaymentStatus::Pending);
    assert_eq!(payments.items[0].amount, 2000);

    let updated = order_service::update_status(
        &state,
        &auth,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "delivered".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(updated.order.status, OrderStatus::Delivered);

    let payments = payment_service::list_by_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(payments.items[0].status, PaymentStatus::Success);

    Ok(())
}

#[tokio::test]
async fn card_order_cancel_has_no_payment_side_effects() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1500).await?;

    let order = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Card,
            vec![OrderItemPayload {
                product_id: product,
                variant_id: None,
                quantity: 1,
            }],
        ),
    )
    .await?
    .data
    .unwrap();

    order_service::update_status(
        &state,
        &auth,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "paid".into(),
        },
    )
    .await?;

    let cancelled = order_service::cancel_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);

    let payments = payment_service::list_by_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert!(payments.items.is_empty(), "card orders get no cod payment");

    Ok(())
}

#[tokio::test]
async fn pending_item_edits_recompute_total_from_snapshot_prices() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product_a = create_product(&state, category, 1000).await?;
    let product_b = create_product(&state, category, 500).await?;

    let order = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Card,
            vec![
                OrderItemPayload {
                    product_id: product_a,
                    variant_id: None,
                    quantity: 2,
                },
                OrderItemPayload {
                    product_id: product_b,
                    variant_id: None,
                    quantity: 1,
                },
            ],
        ),
    )
    .await?
    .data
    .unwrap();
    assert_eq!(order.order.total_amount, 2500);

    // A later price change must not leak into the order's totals.
    let product = axum_storefront_api::entity::Products::find_by_id(product_a)
        .one(&state.orm)
        .await?
        .unwrap();
    let mut active: ProductActive = product.into();
    active.price = Set(9999);
    active.update(&state.orm).await?;

    let item_a = order
        .items
        .iter()
        .find(|i| i.item.product_id == product_a)
        .unwrap()
        .item
        .id;

    let updated = order_service::update_item(
        &state,
        &auth,
        order.order.id,
        item_a,
        UpdateOrderItemRequest { quantity: 3 },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(updated.order.total_amount, 3500);

    let item_b = order
        .items
        .iter()
        .find(|i| i.item.product_id == product_b)
        .unwrap()
        .item
        .id;
    let updated = order_service::remove_item(&state, &auth, order.order.id, item_b)
        .await?
        .data
        .unwrap();
    assert_eq!(updated.order.total_amount, 3000);
    assert_eq!(updated.items.len(), 1);

    Ok(())
}

#[tokio::test]
async fn item_edits_are_rejected_once_the_order_leaves_pending() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let order = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Card,
            vec![OrderItemPayload {
                product_id: product,
                variant_id: None,
                quantity: 1,
            }],
        ),
    )
    .await?
    .data
    .unwrap();

    order_service::update_status(
        &state,
        &auth,
        order.order.id,
        UpdateOrderStatusRequest {
            status: "paid".into(),
        },
    )
    .await?;

    let item = order.items[0].item.id;
    let err = order_service::update_item(
        &state,
        &auth,
        order.order.id,
        item,
        UpdateOrderItemRequest { quantity: 5 },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Transition(_)));

    Ok(())
}

#[tokio::test]
async fn only_pending_and_cancelled_orders_can_be_deleted() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let items = vec![OrderItemPayload {
        product_id: product,
        variant_id: None,
        quantity: 1,
    }];

    let shipped = order_service::create_order(
        &state,
        &auth,
        order_request(buyer, PaymentMethod::Card, items.clone()),
    )
    .await?
    .data
    .unwrap();
    order_service::update_status(
        &state,
        &auth,
        shipped.order.id,
        UpdateOrderStatusRequest {
            status: "shipped".into(),
        },
    )
    .await?;
    let err = order_service::delete_order(&state, &auth, shipped.order.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Transition(_)));

    let pending = order_service::create_order(
        &state,
        &auth,
        order_request(buyer, PaymentMethod::Card, items.clone()),
    )
    .await?
    .data
    .unwrap();
    order_service::delete_order(&state, &auth, pending.order.id).await?;

    let cancelled = order_service::create_order(
        &state,
        &auth,
        order_request(buyer, PaymentMethod::Card, items),
    )
    .await?
    .data
    .unwrap();
    order_service::cancel_order(&state, &auth, cancelled.order.id).await?;
    order_service::delete_order(&state, &auth, cancelled.order.id).await?;

    Ok(())
}

#[tokio::test]
async fn missing_product_fails_order_creation_atomically() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let err = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Cod,
            vec![
                OrderItemPayload {
                    product_id: product,
                    variant_id: None,
                    quantity: 1,
                },
                OrderItemPayload {
                    product_id: Uuid::new_v4(),
                    variant_id: None,
                    quantity: 1,
                },
            ],
        ),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    // Nothing may remain of the rolled-back order.
    let orders = order_service::list_orders(
        &state,
        &auth,
        axum_storefront_api::routes::params::OrderListQuery {
            pagination: axum_storefront_api::routes::params::Pagination {
                page: None,
                per_page: None,
            },
            user_id: Some(buyer),
            status: None,
            sort_order: None,
        },
    )
    .await?
    .data
    .unwrap();
    assert!(orders.items.is_empty());

    Ok(())
}

#[tokio::test]
async fn payment_amount_must_match_order_total_exactly() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let order = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Card,
            vec![OrderItemPayload {
                product_id: product,
                variant_id: None,
                quantity: 2,
            }],
        ),
    )
    .await?
    .data
    .unwrap();

    let err = payment_service::create_payment(
        &state,
        &auth,
        CreatePaymentRequest {
            order_id: order.order.id,
            amount: 1999,
            payment_provider: "stripe".into(),
            transaction_id: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let payment = payment_service::create_payment(
        &state,
        &auth,
        CreatePaymentRequest {
            order_id: order.order.id,
            amount: 2000,
            payment_provider: "stripe".into(),
            transaction_id: Some("tx-1".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    Ok(())
}

#[tokio::test]
async fn payment_success_promotes_pending_order_and_refund_cancels_it() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let order = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Card,
            vec![OrderItemPayload {
                product_id: product,
                variant_id: None,
                quantity: 1,
            }],
        ),
    )
    .await?
    .data
    .unwrap();

    let payment = payment_service::create_payment(
        &state,
        &auth,
        CreatePaymentRequest {
            order_id: order.order.id,
            amount: 1000,
            payment_provider: "stripe".into(),
            transaction_id: None,
        },
    )
    .await?
    .data
    .unwrap();

    // Refunds only apply to successful payments.
    let err = payment_service::refund_payment(
        &state,
        &auth,
        payment.id,
        RefundPaymentRequest {
            transaction_id: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Transition(_)));

    payment_service::update_payment(
        &state,
        &auth,
        payment.id,
        UpdatePaymentRequest {
            status: "success".into(),
            transaction_id: Some("tx-2".into()),
        },
    )
    .await?;

    let promoted = order_service::get_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(promoted.order.status, OrderStatus::Paid);

    let refunded = payment_service::refund_payment(
        &state,
        &auth,
        payment.id,
        RefundPaymentRequest {
            transaction_id: Some("tx-3".into()),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);

    let cancelled = order_service::get_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);

    Ok(())
}

#[tokio::test]
async fn cancelling_an_order_with_a_successful_payment_records_a_refund() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let order = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Card,
            vec![OrderItemPayload {
                product_id: product,
                variant_id: None,
                quantity: 1,
            }],
        ),
    )
    .await?
    .data
    .unwrap();

    let payment = payment_service::create_payment(
        &state,
        &auth,
        CreatePaymentRequest {
            order_id: order.order.id,
            amount: 1000,
            payment_provider: "stripe".into(),
            transaction_id: None,
        },
    )
    .await?
    .data
    .unwrap();
    payment_service::update_payment(
        &state,
        &auth,
        payment.id,
        UpdatePaymentRequest {
            status: "success".into(),
            transaction_id: None,
        },
    )
    .await?;

    order_service::cancel_order(&state, &auth, order.order.id).await?;

    let payments = payment_service::list_by_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(payments.items[0].status, PaymentStatus::Refunded);

    // And the reverse direction stays blocked: no new success on a cancelled order.
    let late = payment_service::create_payment(
        &state,
        &auth,
        CreatePaymentRequest {
            order_id: order.order.id,
            amount: 1000,
            payment_provider: "stripe".into(),
            transaction_id: None,
        },
    )
    .await?
    .data
    .unwrap();
    let err = payment_service::update_payment(
        &state,
        &auth,
        late.id,
        UpdatePaymentRequest {
            status: "success".into(),
            transaction_id: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Transition(_)));

    Ok(())
}

#[tokio::test]
async fn cancelling_a_paid_cod_order_marks_the_pending_payment_failed() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = admin(create_user(&state, "admin").await?);
    let buyer = create_user(&state, "user").await?;
    let category = create_category(&state).await?;
    let product = create_product(&state, category, 1000).await?;

    let order = order_service::create_order(
        &state,
        &auth,
        order_request(
            buyer,
            PaymentMethod::Cod,
            vec![OrderItemPayload {
                product_id: product,
                variant_id: None,
                quantity: 1,
            }],
        ),
    )
    .await?
    .data
    .unwrap();

    order_service::cancel_order(&state, &auth, order.order.id).await?;

    let payments = payment_service::list_by_order(&state, &auth, order.order.id)
        .await?
        .data
        .unwrap();
    assert_eq!(payments.items.len(), 1);
    assert_eq!(payments.items[0].status, PaymentStatus::Failed);

    Ok(())
}
