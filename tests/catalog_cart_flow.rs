use axum_storefront_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::cart::{AddCartItemRequest, UpdateCartItemRequest},
    dto::categories::CreateCategoryRequest,
    dto::products::{CreateProductRequest, ImagePayload, ImageUpdatePayload, UpdateProductRequest},
    error::AppError,
    middleware::auth::AuthUser,
    services::{cart_service, category_service, product_service},
    state::AppState,
};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set, Statement};
use uuid::Uuid;

use axum_storefront_api::entity::users::ActiveModel as UserActive;

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

async fn create_user(state: &AppState, role: &str) -> anyhow::Result<AuthUser> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(format!("{}@example.com", Uuid::new_v4())),
        password_hash: Set("dummy".into()),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;
    Ok(AuthUser {
        user_id: user.id,
        role: role.into(),
    })
}

fn image(url: &str, is_primary: bool) -> ImagePayload {
    ImagePayload {
        url: url.to_string(),
        is_primary,
    }
}

fn product_request(category_id: Uuid, images: Vec<ImagePayload>) -> CreateProductRequest {
    CreateProductRequest {
        name: format!("Product {}", Uuid::new_v4()),
        description: Some("A product for testing".into()),
        price: 1000,
        discount_price: None,
        stock_quantity: 5,
        is_active: Some(true),
        category_id,
        images,
    }
}

fn empty_update() -> UpdateProductRequest {
    UpdateProductRequest {
        name: None,
        description: None,
        price: None,
        discount_price: None,
        stock_quantity: None,
        is_active: None,
        category_id: None,
        images: Vec::new(),
        deleted_image_ids: Vec::new(),
    }
}

#[tokio::test]
async fn category_with_products_cannot_be_deleted() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;

    let category = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: format!("Category {}", Uuid::new_v4()),
            description: None,
        },
    )
    .await?
    .data
    .unwrap();

    let product = product_service::create_product(
        &state,
        &auth,
        product_request(category.id, vec![image("/img/a.webp", false)]),
    )
    .await?
    .data
    .unwrap();

    let err = category_service::delete_category(&state, &auth, category.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Both survive the rejected delete.
    let detail = product_service::get_product(&state, &auth, product.product.id)
        .await?
        .data
        .unwrap();
    assert_eq!(detail.category.id, category.id);

    Ok(())
}

#[tokio::test]
async fn duplicate_category_names_are_rejected() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;
    let name = format!("Category {}", Uuid::new_v4());

    category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: name.clone(),
            description: None,
        },
    )
    .await?;

    let err = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name,
            description: Some("again".into()),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    Ok(())
}

#[tokio::test]
async fn first_supplied_image_becomes_primary_when_none_is_flagged() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;
    let category = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: format!("Category {}", Uuid::new_v4()),
            description: None,
        },
    )
    .await?
    .data
    .unwrap();

    let created = product_service::create_product(
        &state,
        &auth,
        product_request(
            category.id,
            vec![
                image("/img/a.webp", false),
                image("/img/b.webp", false),
                image("/img/c.webp", false),
            ],
        ),
    )
    .await?
    .data
    .unwrap();

    let primaries: Vec<_> = created.images.iter().filter(|i| i.is_primary).collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].url, "/img/a.webp");

    Ok(())
}

#[tokio::test]
async fn only_the_first_designated_primary_wins() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;
    let category = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: format!("Category {}", Uuid::new_v4()),
            description: None,
        },
    )
    .await?
    .data
    .unwrap();

    let created = product_service::create_product(
        &state,
        &auth,
        product_request(
            category.id,
            vec![
                image("/img/a.webp", false),
                image("/img/b.webp", true),
                image("/img/c.webp", true),
            ],
        ),
    )
    .await?
    .data
    .unwrap();

    let primaries: Vec<_> = created.images.iter().filter(|i| i.is_primary).collect();
    assert_eq!(primaries.len(), 1);
    assert_eq!(primaries[0].url, "/img/b.webp");

    Ok(())
}

#[tokio::test]
async fn deleting_every_image_without_replacement_is_rejected() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;
    let category = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: format!("Category {}", Uuid::new_v4()),
            description: None,
        },
    )
    .await?
    .data
    .unwrap();

    let created = product_service::create_product(
        &state,
        &auth,
        product_request(
            category.id,
            vec![image("/img/a.webp", false), image("/img/b.webp", false)],
        ),
    )
    .await?
    .data
    .unwrap();
    let all_ids: Vec<Uuid> = created.images.iter().map(|i| i.id).collect();

    let mut update = empty_update();
    update.deleted_image_ids = all_ids.clone();
    let err = product_service::update_product(&state, &auth, created.product.id, update)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Replacing the whole set in one request is allowed and re-establishes a
    // single primary.
    let mut update = empty_update();
    update.deleted_image_ids = all_ids;
    update.images = vec![ImageUpdatePayload {
        id: None,
        url: Some("/img/new.webp".into()),
        is_primary: false,
    }];
    let updated = product_service::update_product(&state, &auth, created.product.id, update)
        .await?
        .data
        .unwrap();
    assert_eq!(updated.images.len(), 1);
    assert!(updated.images[0].is_primary);
    assert_eq!(updated.images[0].url, "/img/new.webp");

    Ok(())
}

#[tokio::test]
async fn discount_price_must_stay_below_price() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;
    let category = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: format!("Category {}", Uuid::new_v4()),
            description: None,
        },
    )
    .await?
    .data
    .unwrap();

    let mut request = product_request(category.id, Vec::new());
    request.discount_price = Some(1000);
    let err = product_service::create_product(&state, &auth, request)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // The merged values are checked on update as well.
    let created = product_service::create_product(&state, &auth, product_request(category.id, Vec::new()))
        .await?
        .data
        .unwrap();
    let mut update = empty_update();
    update.discount_price = Some(2000);
    let err = product_service::update_product(&state, &auth, created.product.id, update)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    Ok(())
}

#[tokio::test]
async fn search_filters_combine_as_a_conjunction() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;
    let category = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: format!("Category {}", Uuid::new_v4()),
            description: None,
        },
    )
    .await?
    .data
    .unwrap();

    let marker = Uuid::new_v4().simple().to_string();

    let mut cheap = product_request(category.id, Vec::new());
    cheap.name = format!("Walnut Desk {marker}");
    cheap.price = 500;
    let cheap = product_service::create_product(&state, &auth, cheap)
        .await?
        .data
        .unwrap();

    let mut pricey = product_request(category.id, Vec::new());
    pricey.name = format!("Walnut Wardrobe {marker}");
    pricey.price = 5000;
    product_service::create_product(&state, &auth, pricey).await?;

    let mut inactive = product_request(category.id, Vec::new());
    inactive.name = format!("Walnut Stool {marker}");
    inactive.price = 600;
    inactive.is_active = Some(false);
    product_service::create_product(&state, &auth, inactive).await?;

    let query = axum_storefront_api::routes::params::ProductQuery {
        pagination: axum_storefront_api::routes::params::Pagination {
            page: None,
            per_page: None,
        },
        q: Some(marker.clone()),
        category_id: Some(category.id),
        min_price: Some(100),
        max_price: Some(1000),
        is_active: Some(true),
        sort_by: None,
        sort_order: None,
    };
    let found = product_service::list_products(&state, &auth, query)
        .await?
        .data
        .unwrap();
    assert_eq!(found.items.len(), 1);
    assert_eq!(found.items[0].product.id, cheap.product.id);

    Ok(())
}

#[tokio::test]
async fn repeat_cart_adds_increment_quantity_per_variant() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let auth = create_user(&state, "admin").await?;
    let buyer = create_user(&state, "user").await?;
    let category = category_service::create_category(
        &state,
        &auth,
        CreateCategoryRequest {
            name: format!("Category {}", Uuid::new_v4()),
            description: None,
        },
    )
    .await?
    .data
    .unwrap();
    let product = product_service::create_product(
        &state,
        &auth,
        product_request(category.id, vec![image("/img/a.webp", false)]),
    )
    .await?
    .data
    .unwrap();

    let add = |quantity: i32, variant_id: Option<i32>| AddCartItemRequest {
        user_id: buyer.user_id,
        product_id: product.product.id,
        variant_id,
        quantity,
    };

    cart_service::add_item(&state, &buyer, add(2, None)).await?;
    let cart = cart_service::add_item(&state, &buyer, add(3, None))
        .await?
        .data
        .unwrap();
    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].item.quantity, 5);

    // A different variant gets its own row.
    let cart = cart_service::add_item(&state, &buyer, add(1, Some(7)))
        .await?
        .data
        .unwrap();
    assert_eq!(cart.items.len(), 2);

    // Hydration carries the product and its images along.
    assert_eq!(cart.items[0].product.id, product.product.id);
    assert_eq!(cart.items[0].images.len(), 1);

    let item_id = cart
        .items
        .iter()
        .find(|i| i.item.variant_id.is_none())
        .unwrap()
        .item
        .id;
    let cart = cart_service::update_item(
        &state,
        &buyer,
        item_id,
        UpdateCartItemRequest { quantity: 1 },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(
        cart.items.iter().find(|i| i.item.id == item_id).unwrap().item.quantity,
        1
    );

    let cart = cart_service::remove_item(&state, &buyer, item_id)
        .await?
        .data
        .unwrap();
    assert_eq!(cart.items.len(), 1);

    cart_service::clear_cart(&state, &buyer, cart.cart.id).await?;
    let cart = cart_service::get_or_create_cart(&state, &buyer, buyer.user_id)
        .await?
        .data
        .unwrap();
    assert!(cart.items.is_empty());

    Ok(())
}

#[tokio::test]
async fn cart_is_created_lazily_once_per_user() -> anyhow::Result<()> {
    let Some(state) = setup_state().await? else {
        return Ok(());
    };
    let buyer = create_user(&state, "user").await?;

    let first = cart_service::get_or_create_cart(&state, &buyer, buyer.user_id)
        .await?
        .data
        .unwrap();
    let second = cart_service::get_or_create_cart(&state, &buyer, buyer.user_id)
        .await?
        .data
        .unwrap();
    assert_eq!(first.cart.id, second.cart.id);

    let err = cart_service::get_or_create_cart(&state, &buyer, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    Ok(())
}
