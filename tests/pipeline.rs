use std::collections::BTreeSet;
use std::time::Duration;

use car_scout::config::{CurrencyConfig, SchedulerConfig};
use car_scout::currency::CurrencyNormalizer;
use car_scout::models::{Region, TaskStatus};
use car_scout::queue::{BackoffPolicy, SearchCriteria, SearchQueueRegistry};
use car_scout::scheduler::Scheduler;
use car_scout::scrapers::{Adapter, RegionDispatcher, ReplaySource};
use car_scout::storage::Database;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn listing(id: u32, year: i32, price: &str) -> Value {
    json!({
        "source": "replay",
        "brand": "Audi",
        "model": "A4",
        "year": year,
        "price": price,
        "currency": "EUR",
        "mileage": 42000,
        "source_url": format!("https://replay.test/cars/{id}"),
        "city": "Berlin",
        "dealer": "Autohaus Mitte",
        "parsed_at": "2025-01-01T00:00:00Z"
    })
}

fn scheduler(db: &Database, region: Region, source: ReplaySource) -> Scheduler {
    // No rate sources: conversions use the configured anchors (EUR = 99 RUB)
    let currency = CurrencyNormalizer::new(
        "RUB",
        Vec::new(),
        &CurrencyConfig::default().fallback_rates,
        Duration::from_secs(60),
    );
    Scheduler::new(
        db,
        RegionDispatcher::new(2).with_adapter(region, Adapter::Replay(source)),
        currency,
        SchedulerConfig::default(),
        BackoffPolicy::default(),
    )
}

async fn audi_a4(db: &Database, year_from: i32, year_to: i32) -> SearchCriteria {
    let writer = db.writer();
    let brand_id = writer.ensure_brand("Audi").await.unwrap();
    let model_id = writer.ensure_model(brand_id, "A4").await.unwrap();
    SearchCriteria {
        brand_id: Some(brand_id),
        model_id: Some(model_id),
        year_from: Some(year_from),
        year_to: Some(year_to),
        regions: BTreeSet::from([Region::Europe]),
        ..SearchCriteria::default()
    }
}

#[tokio::test]
async fn only_listings_inside_the_year_range_are_stored() {
    let db = Database::in_memory().await.unwrap();
    let registry = SearchQueueRegistry::new(db.pool().clone());
    let criteria = audi_a4(&db, 2018, 2020).await;
    let task_id = registry.enqueue_or_attach(&criteria, 1).await.unwrap().task_id;

    let source = ReplaySource::from_values(vec![
        listing(1, 2017, "10000"),
        listing(2, 2019, "20000"),
        listing(3, 2021, "30000"),
    ]);
    let scheduler = scheduler(&db, Region::Europe, source);
    let mut events = scheduler.subscribe();

    assert_eq!(scheduler.run_cycle(&CancellationToken::new()).await.unwrap(), 1);

    let writer = db.writer();
    assert_eq!(writer.count_listings().await.unwrap(), 1);
    let stored = writer.find_by_url("https://replay.test/cars/2").await.unwrap().unwrap();
    assert_eq!(stored.year, 2019);
    assert_eq!(stored.price, Decimal::from(20_000));
    assert_eq!(stored.converted_price, Decimal::from(1_980_000));
    assert_eq!(stored.converted_currency, "RUB");

    let event = events.recv().await.unwrap();
    assert_eq!(event.task_id, task_id);
    assert_eq!(event.report.fetched, 3);
    assert_eq!(event.report.in_range, 1);
    assert_eq!(event.report.inserted, 1);

    let task = registry.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.consecutive_failures, 0);
    assert!(task.next_parse_at.unwrap() > Utc::now());

    let links = registry.links_for_search(1).await.unwrap();
    assert!(links[0].new_listings_pending);
    assert!(!links[0].price_drop_pending);
}

#[tokio::test]
async fn rerun_deduplicates_and_records_price_drop() {
    let db = Database::in_memory().await.unwrap();
    let registry = SearchQueueRegistry::new(db.pool().clone());
    let criteria = audi_a4(&db, 2015, 2025).await;
    let task_id = registry.enqueue_or_attach(&criteria, 7).await.unwrap().task_id;
    let shutdown = CancellationToken::new();

    let first = scheduler(
        &db,
        Region::Europe,
        ReplaySource::from_values(vec![listing(1, 2019, "20000"), listing(2, 2020, "25000")]),
    );
    first.run_cycle(&shutdown).await.unwrap();
    registry.mark_notified(7, task_id).await.unwrap();

    // Same cars a day later, one of them cheaper
    let second = scheduler(
        &db,
        Region::Europe,
        ReplaySource::from_values(vec![listing(1, 2019, "18500"), listing(2, 2020, "25000")]),
    );
    let claimed = db
        .tasks()
        .claim_due(1, second.worker_id(), chrono::Duration::minutes(15), Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let mut events = second.subscribe();
    second.process_task(claimed[0].clone(), &shutdown).await;

    let report = events.recv().await.unwrap().report;
    assert_eq!(report.inserted, 0);
    assert_eq!(report.price_changes, 1);
    assert_eq!(report.price_drops, 1);
    assert_eq!(report.unchanged, 1);

    let writer = db.writer();
    assert_eq!(writer.count_listings().await.unwrap(), 2);
    let cheaper = writer.find_by_url("https://replay.test/cars/1").await.unwrap().unwrap();
    assert_eq!(cheaper.price, Decimal::from(18_500));

    let history = writer.price_history(cheaper.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change.old_price, Decimal::from(20_000));
    assert_eq!(history[0].change.new_price, Decimal::from(18_500));

    let links = registry.links_for_search(7).await.unwrap();
    assert!(!links[0].new_listings_pending);
    assert!(links[0].price_drop_pending);
}

#[tokio::test]
async fn unreachable_site_fails_the_task_with_backoff() {
    let db = Database::in_memory().await.unwrap();
    let registry = SearchQueueRegistry::new(db.pool().clone());
    let criteria = audi_a4(&db, 2015, 2025).await;
    let task_id = registry.enqueue_or_attach(&criteria, 1).await.unwrap().task_id;

    let scheduler = scheduler(&db, Region::Europe, ReplaySource::failing("connection refused"));
    let before = Utc::now();
    scheduler.run_cycle(&CancellationToken::new()).await.unwrap();

    let task = registry.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.consecutive_failures, 1);
    assert!(task.last_error.unwrap().contains("connection refused"));

    let next = task.next_parse_at.unwrap();
    assert!(next >= before + chrono::Duration::minutes(10));
    assert!(next <= Utc::now() + chrono::Duration::minutes(10));
    assert!(task.lease_owner.is_none());

    // Not due again until the backoff elapses
    assert_eq!(scheduler.run_cycle(&CancellationToken::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn region_without_adapter_fails_the_task() {
    let db = Database::in_memory().await.unwrap();
    let registry = SearchQueueRegistry::new(db.pool().clone());
    let criteria = audi_a4(&db, 2015, 2025).await;
    let task_id = registry.enqueue_or_attach(&criteria, 1).await.unwrap().task_id;

    // Task wants Europe, only China is bound
    let scheduler = scheduler(&db, Region::China, ReplaySource::from_values(Vec::new()));
    scheduler.run_cycle(&CancellationToken::new()).await.unwrap();

    let task = registry.task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.unwrap().contains("no adapter"));
}

#[tokio::test]
async fn concurrent_workers_never_share_a_task() {
    let db = Database::in_memory().await.unwrap();
    let registry = SearchQueueRegistry::new(db.pool().clone());
    let criteria = audi_a4(&db, 2015, 2025).await;
    registry.enqueue_or_attach(&criteria, 1).await.unwrap();

    let records = vec![listing(1, 2019, "20000")];
    let a = scheduler(&db, Region::Europe, ReplaySource::from_values(records.clone()));
    let b = scheduler(&db, Region::Europe, ReplaySource::from_values(records));
    assert_ne!(a.worker_id(), b.worker_id());

    let shutdown = CancellationToken::new();
    let (ran_a, ran_b) = tokio::join!(a.run_cycle(&shutdown), b.run_cycle(&shutdown));
    assert_eq!(ran_a.unwrap() + ran_b.unwrap(), 1);
    assert_eq!(db.writer().count_listings().await.unwrap(), 1);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let db = Database::in_memory().await.unwrap();
    let scheduler = scheduler(&db, Region::Europe, ReplaySource::from_values(Vec::new()));
    let shutdown = CancellationToken::new();

    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), scheduler.run(shutdown))
        .await
        .expect("scheduler should stop after shutdown");
}
