use std::sync::Arc;

use chrono::Utc;
use delivery_orchestrator::config::Config;
use delivery_orchestrator::error::OrchestratorError;
use delivery_orchestrator::external::memory::{
    FixedGeocoder, InMemoryInventory, InMemoryOrderStore, InMemoryPartnerDirectory,
    RecordingNotificationSink,
};
use delivery_orchestrator::external::{Audience, InventoryService, OrderStore};
use delivery_orchestrator::models::order::{Order, OrderItem, OrderStatus, PaymentStatus};
use delivery_orchestrator::models::partner::{GeoPoint, Partner, VehicleKind};
use delivery_orchestrator::models::tracking::{LocationUpdate, SessionStatus};
use delivery_orchestrator::workflow::integration::{Orchestrator, run_side_effect_worker};
use delivery_orchestrator::workflow::rules::TriggerKind;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

struct TestContext {
    orchestrator: Arc<Orchestrator>,
    store: Arc<InMemoryOrderStore>,
    partners: Arc<InMemoryPartnerDirectory>,
    inventory: Arc<InMemoryInventory>,
    notifier: Arc<RecordingNotificationSink>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> TestContext {
    init_tracing();
    let store = Arc::new(InMemoryOrderStore::new());
    let partners = Arc::new(InMemoryPartnerDirectory::new());
    let inventory = Arc::new(InMemoryInventory::new());
    let notifier = Arc::new(RecordingNotificationSink::new());
    let geocoder = Arc::new(FixedGeocoder::default());

    let orchestrator = Orchestrator::new(
        Config::default(),
        store.clone(),
        partners.clone(),
        inventory.clone(),
        notifier.clone(),
        geocoder,
    );

    TestContext {
        orchestrator,
        store,
        partners,
        inventory,
        notifier,
    }
}

fn campus_partner(priority_class: bool) -> Partner {
    Partner {
        id: Uuid::new_v4(),
        name: "test-partner".to_string(),
        online: true,
        active: true,
        rating: 4.5,
        total_deliveries: 25,
        priority_class,
        vehicle: VehicleKind::Bicycle,
        location: Some(GeoPoint { lat: 0.0, lng: 0.0 }),
        updated_at: Utc::now(),
    }
}

async fn seed_order(ctx: &TestContext, items: Vec<OrderItem>) -> Uuid {
    let order_id = Uuid::new_v4();
    let order = Order::new(order_id, items, Some(GeoPoint { lat: 0.03, lng: 0.0 }));
    ctx.store.insert_order(order).await.unwrap();
    order_id
}

async fn seed_paid_order_at(ctx: &TestContext, status: OrderStatus) -> Uuid {
    let order_id = seed_order(ctx, Vec::new()).await;
    ctx.store
        .set_payment_status(order_id, PaymentStatus::Completed, Utc::now())
        .await
        .unwrap();
    ctx.store
        .update_status(order_id, status, Utc::now())
        .await
        .unwrap();
    order_id
}

async fn current_status(ctx: &TestContext, order_id: Uuid) -> OrderStatus {
    ctx.store.load_order(order_id).await.unwrap().status
}

#[tokio::test]
async fn payment_confirmation_moves_placed_to_confirmed() {
    let ctx = setup();
    let order_id = seed_order(&ctx, Vec::new()).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    let report = ctx
        .orchestrator
        .handle_payment_confirmation(order_id)
        .await
        .unwrap();

    assert!(report.fully_applied());
    assert_eq!(report.event.from, OrderStatus::Placed);
    assert_eq!(report.event.to, OrderStatus::Confirmed);
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Confirmed);

    let order = ctx.store.load_order(order_id).await.unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Completed);
    assert!(order.paid_at.is_some());
    assert!(order.accepted_at.is_some());

    // Payment confirmation declares customer + invoice notifications.
    let customer = ctx.notifier.sent_to(Audience::Customer);
    assert_eq!(customer.len(), 2);
}

#[tokio::test]
async fn confirmation_without_payment_is_rejected() {
    let ctx = setup();
    let order_id = seed_order(&ctx, Vec::new()).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    let result = ctx
        .orchestrator
        .transition_order(order_id, OrderStatus::Confirmed, TriggerKind::Payment)
        .await;

    assert!(matches!(
        result,
        Err(OrchestratorError::PreconditionNotMet(_))
    ));
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Placed);
}

#[tokio::test]
async fn illegal_transition_is_rejected_without_state_change() {
    let ctx = setup();
    let order_id = seed_order(&ctx, Vec::new()).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    let result = ctx
        .orchestrator
        .transition_order(order_id, OrderStatus::Delivered, TriggerKind::Manual)
        .await;

    assert!(matches!(
        result,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Placed);
}

#[tokio::test]
async fn unknown_order_reports_not_found() {
    let ctx = setup();
    let result = ctx.orchestrator.get_workflow_status(Uuid::new_v4()).await;
    assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn full_delivery_flow_confirms_inventory_sale() {
    let ctx = setup();
    let product_id = Uuid::new_v4();
    ctx.inventory.set_stock(product_id, 10);
    ctx.inventory.reserve(product_id, 2).await.unwrap();

    let partner = campus_partner(false);
    let partner_id = partner.id;
    ctx.partners.upsert(partner);

    let order_id = seed_order(
        &ctx,
        vec![OrderItem {
            product_id,
            quantity: 2,
        }],
    )
    .await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    ctx.orchestrator
        .handle_payment_confirmation(order_id)
        .await
        .unwrap();
    ctx.orchestrator
        .transition_order(order_id, OrderStatus::Preparing, TriggerKind::Manual)
        .await
        .unwrap();
    ctx.orchestrator
        .transition_order(order_id, OrderStatus::Ready, TriggerKind::Manual)
        .await
        .unwrap();
    ctx.orchestrator
        .handle_partner_assignment(order_id, partner_id)
        .await
        .unwrap();
    ctx.orchestrator
        .handle_order_pickup(order_id, partner_id)
        .await
        .unwrap();
    ctx.orchestrator
        .transition_order(order_id, OrderStatus::OutForDelivery, TriggerKind::PartnerAction)
        .await
        .unwrap();
    let report = ctx
        .orchestrator
        .handle_order_delivery(order_id, partner_id)
        .await
        .unwrap();

    assert!(report.fully_applied());
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Delivered);

    let order = ctx.store.load_order(order_id).await.unwrap();
    assert!(order.delivered_at.is_some());
    assert_eq!(order.assigned_partner_id, Some(partner_id));

    let level = ctx.inventory.level(product_id);
    assert_eq!(level.sold, 2);
    assert_eq!(level.reserved, 0);

    assert_eq!(ctx.orchestrator.dispatcher().deliveries_today(partner_id), 1);
}

#[tokio::test]
async fn pickup_by_unassigned_partner_is_rejected() {
    let ctx = setup();
    let partner = campus_partner(false);
    ctx.partners.upsert(partner.clone());

    let order_id = seed_paid_order_at(&ctx, OrderStatus::Ready).await;
    ctx.orchestrator
        .handle_partner_assignment(order_id, partner.id)
        .await
        .unwrap();

    let imposter = Uuid::new_v4();
    let result = ctx.orchestrator.handle_order_pickup(order_id, imposter).await;

    assert!(matches!(
        result,
        Err(OrchestratorError::PreconditionNotMet(_))
    ));
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Assigned);
}

#[tokio::test]
async fn cancelling_a_paid_order_refunds_and_releases_inventory() {
    let ctx = setup();
    let product_id = Uuid::new_v4();
    ctx.inventory.set_stock(product_id, 5);
    ctx.inventory.reserve(product_id, 3).await.unwrap();

    let order_id = seed_order(
        &ctx,
        vec![OrderItem {
            product_id,
            quantity: 3,
        }],
    )
    .await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();
    ctx.orchestrator
        .handle_payment_confirmation(order_id)
        .await
        .unwrap();

    let report = ctx
        .orchestrator
        .handle_order_cancellation(order_id, "customer request")
        .await
        .unwrap();

    assert!(report.fully_applied());
    let order = ctx.store.load_order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert!(order.cancelled_at.is_some());

    // All reserved lines went back on hand.
    let level = ctx.inventory.level(product_id);
    assert_eq!(level.reserved, 0);
    assert_eq!(level.on_hand, 5);

    let admin = ctx.notifier.sent_to(Audience::Admin);
    assert!(!admin.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unpaid_order_auto_cancels_after_placement_timeout() {
    let ctx = setup();
    let order_id = seed_order(&ctx, Vec::new()).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    sleep(Duration::from_secs(10 * 60 + 1)).await;

    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Cancelled);
    assert!(!ctx.orchestrator.engine().has_armed_timer(order_id));
}

#[tokio::test(start_paused = true)]
async fn paid_order_progresses_to_ready_on_timeouts() {
    let ctx = setup();
    let order_id = seed_order(&ctx, Vec::new()).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    sleep(Duration::from_secs(30)).await;
    ctx.orchestrator
        .handle_payment_confirmation(order_id)
        .await
        .unwrap();
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Confirmed);

    // Kitchen confirmation times out into preparing.
    sleep(Duration::from_secs(2 * 60 + 1)).await;
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Preparing);

    // Preparation times out into ready.
    sleep(Duration::from_secs(15 * 60 + 1)).await;
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn manual_transition_disarms_the_pending_timeout() {
    let ctx = setup();
    let order_id = seed_order(&ctx, Vec::new()).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    sleep(Duration::from_secs(9 * 60)).await;
    ctx.orchestrator
        .handle_payment_confirmation(order_id)
        .await
        .unwrap();

    // Past the original placement deadline; the cancel timer must be gone.
    sleep(Duration::from_secs(2 * 60)).await;
    let status = current_status(&ctx, order_id).await;
    assert_ne!(status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn duplicate_automatic_firing_is_a_noop() {
    let ctx = setup();
    let order_id = seed_paid_order_at(&ctx, OrderStatus::PickedUp).await;

    let first = ctx
        .orchestrator
        .engine()
        .transition(order_id, OrderStatus::OutForDelivery, TriggerKind::Automatic)
        .await;
    assert!(first.is_ok());

    // A stale duplicate firing finds the status already advanced.
    let second = ctx
        .orchestrator
        .engine()
        .transition(order_id, OrderStatus::OutForDelivery, TriggerKind::Automatic)
        .await;
    assert!(matches!(
        second,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    assert_eq!(
        current_status(&ctx, order_id).await,
        OrderStatus::OutForDelivery
    );
}

#[tokio::test]
async fn recover_timers_rearms_non_terminal_orders() {
    let ctx = setup();
    let in_flight = seed_paid_order_at(&ctx, OrderStatus::Preparing).await;
    let done = seed_paid_order_at(&ctx, OrderStatus::Delivered).await;

    let armed = ctx.orchestrator.recover_timers().await.unwrap();

    assert_eq!(armed, 1);
    assert!(ctx.orchestrator.engine().has_armed_timer(in_flight));
    assert!(!ctx.orchestrator.engine().has_armed_timer(done));
}

#[tokio::test(start_paused = true)]
async fn worker_dispatches_effects_of_automatic_transitions() {
    let ctx = setup();
    tokio::spawn(run_side_effect_worker(ctx.orchestrator.clone()));

    let order_id = seed_order(&ctx, Vec::new()).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Placed)
        .await
        .unwrap();

    sleep(Duration::from_secs(10 * 60 + 1)).await;
    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Cancelled);

    // Give the worker a turn to drain the event.
    sleep(Duration::from_secs(1)).await;
    assert!(!ctx.notifier.sent_to(Audience::Customer).is_empty());
    assert!(!ctx.notifier.sent_to(Audience::Admin).is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_ready_order_alerts_admin_without_moving() {
    let ctx = setup();
    tokio::spawn(run_side_effect_worker(ctx.orchestrator.clone()));

    let order_id = seed_paid_order_at(&ctx, OrderStatus::Ready).await;
    ctx.orchestrator
        .initialize_order(order_id, OrderStatus::Ready)
        .await
        .unwrap();

    sleep(Duration::from_secs(30 * 60 + 1)).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(current_status(&ctx, order_id).await, OrderStatus::Ready);
    let alerts = ctx.notifier.sent_to(Audience::Admin);
    assert!(alerts.iter().any(|n| n.order_id == order_id));
}

#[tokio::test]
async fn pickup_with_known_position_starts_tracking_with_eta() {
    let ctx = setup();
    let partner = campus_partner(false);
    let partner_id = partner.id;
    ctx.partners.upsert(partner);

    let order_id = seed_paid_order_at(&ctx, OrderStatus::Ready).await;
    ctx.orchestrator
        .handle_partner_assignment(order_id, partner_id)
        .await
        .unwrap();

    ctx.orchestrator.update_partner_location(LocationUpdate {
        partner_id,
        location: GeoPoint { lat: 0.0, lng: 0.0 },
        order_id: None,
    });
    ctx.orchestrator
        .handle_order_pickup(order_id, partner_id)
        .await
        .unwrap();

    let session = ctx
        .orchestrator
        .get_tracking_session(partner_id, order_id)
        .unwrap();
    assert_eq!(session.status, SessionStatus::Started);

    // The order's drop-off is ~3.3 km out; at 15 km/h that is ~13 minutes.
    let status = ctx.orchestrator.get_workflow_status(order_id).await.unwrap();
    let eta = status.estimated_delivery_minutes.unwrap();
    assert!((12..=14).contains(&eta), "eta was {eta} minutes");

    ctx.orchestrator
        .transition_order(order_id, OrderStatus::OutForDelivery, TriggerKind::PartnerAction)
        .await
        .unwrap();
    ctx.orchestrator
        .handle_order_delivery(order_id, partner_id)
        .await
        .unwrap();
    assert!(
        ctx.orchestrator
            .get_tracking_session(partner_id, order_id)
            .is_none()
    );
}

#[tokio::test]
async fn workflow_status_reports_assignment_and_payment() {
    let ctx = setup();
    let partner = campus_partner(false);
    ctx.partners.upsert(partner.clone());

    let order_id = seed_paid_order_at(&ctx, OrderStatus::Ready).await;
    ctx.orchestrator
        .handle_partner_assignment(order_id, partner.id)
        .await
        .unwrap();

    let status = ctx.orchestrator.get_workflow_status(order_id).await.unwrap();
    assert_eq!(status.current_status, OrderStatus::Assigned);
    assert_eq!(status.payment_status, PaymentStatus::Completed);
    assert_eq!(status.assigned_to, Some(partner.id));

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["current_status"], "Assigned");
    assert_eq!(json["payment_status"], "Completed");
    assert_eq!(json["assigned_to"], partner.id.to_string());
}
