use std::time::Duration;

use assert_matches::assert_matches;
use futures::StreamExt;

use super::*;
use crate::test_utils::Probe;

fn endpoint(name: &str) -> Endpoint {
    Probe::new(name).endpoint()
}

#[test]
fn test_register_lookup_deregister() {
    let registry = Registry::new();
    let a = endpoint("us-east-1.api.0");
    let b = endpoint("us-east-1.api.1");

    assert!(registry.register("api", &a).unwrap());
    assert!(registry.register("api", &b).unwrap());
    assert_eq!(registry.lookup("api"), vec![a.clone(), b.clone()]);
    assert_eq!(registry.service_of(&a).as_deref(), Some("api"));
    assert_eq!(registry.len(), 2);

    assert!(registry.deregister(&a));
    assert_eq!(registry.lookup("api"), vec![b.clone()]);
    assert!(registry.deregister(&b));
    assert!(registry.lookup("api").is_empty());
    assert!(registry.services().is_empty());
    assert!(registry.is_empty());
}

#[test]
fn test_register_and_deregister_are_idempotent() {
    let registry = Registry::new();
    let a = endpoint("us-east-1.api.0");

    assert!(registry.register("api", &a).unwrap());
    assert!(!registry.register("api", &a).unwrap());
    assert_eq!(registry.lookup("api").len(), 1);

    assert!(registry.deregister(&a));
    assert!(!registry.deregister(&a));
    assert!(registry.lookup("api").is_empty());

    // Only a fresh registration brings it back.
    assert!(registry.register("api", &a).unwrap());
    assert_eq!(registry.lookup("api"), vec![a]);
}

#[test]
fn test_endpoint_has_one_name() {
    let registry = Registry::new();
    let a = endpoint("us-east-1.api.0");
    registry.register("api", &a).unwrap();
    assert_matches!(
        registry.register("cart", &a),
        Err(RegistryError::Conflict { existing, requested, .. }) if existing == "api" && requested == "cart"
    );
    assert!(registry.lookup("cart").is_empty());
}

#[test]
fn test_unknown_lookup_is_empty() {
    let registry = Registry::new();
    assert!(registry.lookup("nothing").is_empty());
    let listings = registry.lookup_many(&["nothing".to_string()]);
    assert_eq!(listings.len(), 1);
    assert!(listings[0].endpoints.is_empty());
}

#[test]
fn test_services_are_sorted() {
    let registry = Registry::new();
    registry.register("web", &endpoint("us-east-1.web.0")).unwrap();
    registry.register("api", &endpoint("us-east-1.api.0")).unwrap();
    assert_eq!(registry.services(), vec!["api", "web"]);
}

#[tokio::test]
async fn test_subscription_yields_members_then_updates() {
    let registry = Registry::new();
    let a = endpoint("us-east-1.api.0");
    let b = endpoint("us-east-1.api.1");
    registry.register("api", &a).unwrap();

    let mut subscription = registry.subscribe("api");
    assert_eq!(subscription.service(), "api");
    registry.register("api", &b).unwrap();
    registry.register("web", &endpoint("us-east-1.web.0")).unwrap();
    registry.deregister(&b);

    assert_eq!(subscription.next().await, Some(ListingUpdate::Registered(a)));
    assert_eq!(
        subscription.next().await,
        Some(ListingUpdate::Registered(b.clone()))
    );
    assert_eq!(
        subscription.next().await,
        Some(ListingUpdate::Deregistered(b))
    );
    assert_eq!(subscription.some_next(), None);
}

#[tokio::test]
async fn test_dropped_subscription_is_pruned() {
    let registry = Registry::new();
    drop(registry.subscribe("api"));
    registry.register("api", &endpoint("us-east-1.api.0")).unwrap();
    assert!(
        registry
            .inner
            .read()
            .subscriptions
            .get("api")
            .is_none_or(Vec::is_empty)
    );
}

#[tokio::test(start_paused = true)]
async fn test_polling_follows_registrations() {
    let registry = Registry::new();
    let mut polling = registry.poll("api", Duration::from_secs(1));
    assert_eq!(polling.period(), Duration::from_secs(1));
    assert_eq!(polling.services(), ["api".to_string()]);

    let first = polling.next().await.unwrap();
    assert!(first[0].endpoints.is_empty());

    let a = endpoint("us-east-1.api.0");
    registry.register("api", &a).unwrap();
    let second = polling.next().await.unwrap();
    assert_eq!(second[0].endpoints, vec![a.clone()]);

    registry.deregister(&a);
    polling.restart();
    let third = tokio::time::timeout(Duration::from_millis(1), polling.next())
        .await
        .unwrap()
        .unwrap();
    assert!(third[0].endpoints.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deferred_polling_waits_a_period() {
    let registry = Registry::new();
    let mut polling = registry.poll("api", Duration::from_secs(1));
    polling.defer();
    assert!(
        tokio::time::timeout(Duration::from_millis(500), polling.next())
            .await
            .is_err()
    );
    assert!(polling.next().await.is_some());
}

#[tokio::test]
async fn test_concurrent_register_and_lookup() {
    let registry = Registry::new();
    let mut tasks = Vec::new();
    for task in 0..8 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            for index in 0..50 {
                let e = endpoint(&format!("us-east-1.svc{task}.{index}"));
                registry.register("shared", &e).unwrap();
                assert!(registry.lookup("shared").contains(&e));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(registry.lookup("shared").len(), 400);
}
