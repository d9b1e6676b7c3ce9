#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kmirror_core::{DeltaType, Error, ObjectKey};
use kmirror_store::{DeltaQueue, Indexer, Popped, QueueItem, Window};
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;

fn cm(name: &str, rv: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("ns".into()),
            resource_version: Some(rv.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn key(name: &str) -> ObjectKey { ObjectKey::new(Some("ns"), name) }

fn kinds(q: &DeltaQueue<ConfigMap>, name: &str) -> Vec<(DeltaType, bool)> {
    q.get(&key(name)).map(|c| c.iter().map(|d| (d.kind, d.final_state_unknown)).collect()).unwrap_or_default()
}

/// What the reconcile loop does with a popped chain.
fn apply(store: &Indexer<ConfigMap>, popped: &Popped<ConfigMap>) {
    for d in popped.deltas.iter() {
        match d.kind {
            DeltaType::Deleted => {
                store.remove(&d.key);
            }
            _ => {
                store.upsert(d.key.clone(), Arc::clone(&d.object));
            }
        }
    }
}

async fn pop_item(q: &DeltaQueue<ConfigMap>) -> QueueItem<ConfigMap> {
    let cancel = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(1), q.pop(&cancel)).await.expect("pop timed out").expect("queue closed")
}

async fn pop_now(q: &DeltaQueue<ConfigMap>) -> Popped<ConfigMap> {
    match pop_item(q).await {
        QueueItem::Chain(p) => p,
        QueueItem::EmptyList => panic!("expected a chain, got an empty-List marker"),
    }
}

/// Apply and acknowledge everything queued; returns the deletions seen per key.
async fn drain(q: &DeltaQueue<ConfigMap>, store: &Indexer<ConfigMap>) -> Vec<ObjectKey> {
    let mut deleted = Vec::new();
    while !q.is_empty() {
        let p = pop_now(q).await;
        apply(store, &p);
        deleted.extend(p.deltas.iter().filter(|d| d.is_deletion()).map(|d| d.key.clone()));
        q.done(&p);
    }
    deleted
}

#[tokio::test]
async fn pushes_for_one_key_share_a_chain() {
    let store = Arc::new(Indexer::new());
    let q = DeltaQueue::new(store);
    q.add(cm("a", "1")).unwrap();
    q.update(cm("a", "2")).unwrap();
    q.add(cm("b", "3")).unwrap();
    q.delete(cm("a", "2")).unwrap();
    q.delete(cm("a", "2")).unwrap();

    assert_eq!(q.len(), 2);
    assert_eq!(q.list_keys(), vec![key("a"), key("b")]);
    assert_eq!(
        kinds(&q, "a"),
        vec![(DeltaType::Added, false), (DeltaType::Updated, false), (DeltaType::Deleted, false)]
    );

    let first = pop_now(&q).await;
    assert_eq!(first.key, key("a"));
    let rvs: Vec<_> = first.deltas.iter().map(|d| d.object.metadata.resource_version.clone().unwrap()).collect();
    assert_eq!(rvs, vec!["1", "2", "2"]);
    q.done(&first);
    assert_eq!(pop_now(&q).await.key, key("b"));
}

#[tokio::test]
async fn replace_synthesizes_deletions_for_vanished_keys() {
    let store = Arc::new(Indexer::new());
    for n in ["A", "B", "C"] {
        store.add(Arc::new(cm(n, "1"))).unwrap();
    }
    let q = DeltaQueue::new(Arc::clone(&store));
    q.replace(vec![cm("A", "2"), cm("C", "2")], "10").unwrap();

    assert_eq!(q.len(), 3);
    assert_eq!(kinds(&q, "A"), vec![(DeltaType::Replaced, false)]);
    assert_eq!(kinds(&q, "C"), vec![(DeltaType::Replaced, false)]);
    assert_eq!(kinds(&q, "B"), vec![(DeltaType::Deleted, true)]);
    // the synthesized deletion carries the last known object
    let b = q.get(&key("B")).unwrap();
    assert_eq!(b.newest().unwrap().object.metadata.resource_version.as_deref(), Some("1"));
}

#[tokio::test]
async fn replace_considers_queued_keys_as_known() {
    let store = Arc::new(Indexer::new());
    let q = DeltaQueue::new(store);
    q.add(cm("pending", "1")).unwrap();
    q.add(cm("gone", "1")).unwrap();
    q.delete(cm("gone", "2")).unwrap();
    q.replace(vec![], "5").unwrap();

    assert_eq!(
        kinds(&q, "pending"),
        vec![(DeltaType::Added, false), (DeltaType::Deleted, true)]
    );
    // already on its way out: no second deletion
    assert_eq!(kinds(&q, "gone"), vec![(DeltaType::Added, false), (DeltaType::Deleted, false)]);
}

#[tokio::test]
async fn has_synced_tracks_the_listed_batch() {
    let store = Arc::new(Indexer::new());
    let q = DeltaQueue::new(Arc::clone(&store));
    assert!(!q.has_synced());

    q.replace(vec![cm("X", "1"), cm("Y", "1")], "1").unwrap();
    assert!(!q.has_synced());

    let x = pop_now(&q).await;
    apply(&store, &x);
    assert!(!q.has_synced());
    q.done(&x);
    assert!(!q.has_synced());

    let y = pop_now(&q).await;
    apply(&store, &y);
    q.done(&y);
    assert!(q.has_synced());

    // steady-state traffic keeps it true
    q.update(cm("X", "2")).unwrap();
    assert!(q.has_synced());
    let x2 = pop_now(&q).await;
    q.done(&x2);
    assert!(q.has_synced());

    // a relist resets it until that batch is applied
    q.replace(vec![cm("X", "3")], "3").unwrap();
    assert!(!q.has_synced());
    let mut synced = q.synced();
    let (a, b) = (pop_now(&q).await, pop_now(&q).await);
    q.done(&a);
    q.done(&b);
    tokio::time::timeout(Duration::from_secs(1), synced.wait_for(|s| *s)).await.unwrap().unwrap();
}

#[tokio::test]
async fn empty_replace_is_synced_immediately() {
    let q = DeltaQueue::<ConfigMap>::new(Arc::new(Indexer::new()));
    q.replace(vec![], "1").unwrap();
    assert!(q.has_synced());
    assert!(matches!(pop_item(&q).await, QueueItem::EmptyList));
    assert!(q.is_empty());
}

#[tokio::test]
async fn listed_batch_is_handed_out_as_one_window() {
    let q = DeltaQueue::new(Arc::new(Indexer::new()));
    q.replace(vec![cm("X", "2"), cm("Y", "2")], "2").unwrap();
    let x = pop_now(&q).await;
    assert_eq!(x.window, Window::Opens);
    q.done(&x);

    // A relist while the window is open extends it instead of opening another.
    q.update(cm("Z", "3")).unwrap();
    q.replace(vec![cm("X", "4"), cm("Y", "4"), cm("Z", "4")], "4").unwrap();
    let mut windows = Vec::new();
    while !q.is_empty() {
        let p = pop_now(&q).await;
        windows.push(p.window);
        q.done(&p);
    }
    assert_eq!(windows, vec![Window::Within, Window::Within, Window::Closes]);
    assert!(q.has_synced());

    q.update(cm("W", "5")).unwrap();
    let w = pop_now(&q).await;
    assert_eq!(w.window, Window::Outside);
    q.done(&w);

    q.replace(vec![cm("X", "6")], "6").unwrap();
    let only = pop_now(&q).await;
    assert_eq!(only.window, Window::Whole);
    assert!(only.window.opens() && only.window.closes());
    q.done(&only);
}

#[tokio::test]
async fn relist_deletes_a_key_whose_add_is_in_flight() {
    let store = Arc::new(Indexer::new());
    let q = DeltaQueue::new(Arc::clone(&store));
    q.add(cm("x", "1")).unwrap();
    let inflight = pop_now(&q).await;

    q.replace(vec![], "5").unwrap();
    assert_eq!(kinds(&q, "x"), vec![(DeltaType::Deleted, true)]);

    apply(&store, &inflight);
    q.done(&inflight);
    assert_eq!(drain(&q, &store).await, vec![key("x")]);
    assert!(store.get(&key("x")).is_none(), "store after relist: {:?}", store.list_keys());
}

#[tokio::test]
async fn relist_does_not_repeat_an_in_flight_deletion() {
    let store = Arc::new(Indexer::new());
    store.add(Arc::new(cm("x", "1"))).unwrap();
    let q = DeltaQueue::new(Arc::clone(&store));
    q.delete(cm("x", "2")).unwrap();
    let inflight = pop_now(&q).await;

    q.replace(vec![], "5").unwrap();
    assert!(kinds(&q, "x").is_empty());
    assert!(matches!(pop_item(&q).await, QueueItem::EmptyList));

    apply(&store, &inflight);
    q.done(&inflight);
    let mut deleted: Vec<_> = inflight.deltas.iter().filter(|d| d.is_deletion()).map(|d| d.key.clone()).collect();
    deleted.extend(drain(&q, &store).await);
    assert_eq!(deleted, vec![key("x")]);
}

#[tokio::test]
async fn resync_skips_keys_with_pending_chains() {
    let store = Arc::new(Indexer::new());
    store.add(Arc::new(cm("a", "1"))).unwrap();
    store.add(Arc::new(cm("b", "1"))).unwrap();
    let q = DeltaQueue::new(Arc::clone(&store));
    q.update(cm("a", "2")).unwrap();
    q.resync().unwrap();

    assert_eq!(kinds(&q, "a"), vec![(DeltaType::Updated, false)]);
    assert_eq!(kinds(&q, "b"), vec![(DeltaType::Sync, false)]);
}

#[tokio::test]
async fn pop_observes_cancel_and_close() {
    let q = Arc::new(DeltaQueue::<ConfigMap>::new(Arc::new(Indexer::new())));
    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let q = Arc::clone(&q);
        let cancel = cancel.clone();
        async move { q.pop(&cancel).await.is_none() }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());

    let waiter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.pop(&CancellationToken::new()).await.is_none() }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.close();
    assert!(tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap());

    assert_eq!(q.add(cm("late", "1")), Err(Error::ShutDown));
    assert_eq!(q.replace(vec![], "1"), Err(Error::ShutDown));
    assert_eq!(q.resync(), Err(Error::ShutDown));
}

#[tokio::test]
async fn objects_without_name_are_rejected() {
    let q = DeltaQueue::<ConfigMap>::new(Arc::new(Indexer::new()));
    assert_eq!(q.add(ConfigMap::default()), Err(Error::MissingName));
    assert!(q.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_chain_in_flight_per_key() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 200;
    let store = Arc::new(Indexer::new());
    let q = Arc::new(DeltaQueue::new(store));
    let in_flight: Arc<Mutex<HashSet<ObjectKey>>> = Arc::default();
    let consumed = Arc::new(Mutex::new(0usize));
    let cancel = CancellationToken::new();

    let mut consumers = Vec::new();
    for _ in 0..3 {
        let (q, in_flight, consumed, cancel) = (Arc::clone(&q), Arc::clone(&in_flight), Arc::clone(&consumed), cancel.clone());
        consumers.push(tokio::spawn(async move {
            while let Some(QueueItem::Chain(p)) = q.pop(&cancel).await {
                assert!(in_flight.lock().unwrap().insert(p.key.clone()), "key {} handed out twice", p.key);
                *consumed.lock().unwrap() += p.deltas.len();
                tokio::task::yield_now().await;
                in_flight.lock().unwrap().remove(&p.key);
                q.done(&p);
            }
        }));
    }

    let mut producers = Vec::new();
    for i in 0..PRODUCERS {
        let q = Arc::clone(&q);
        producers.push(tokio::spawn(async move {
            for n in 0..PER_PRODUCER {
                let name = if n % 2 == 0 { "hot" } else { "warm" };
                q.update(cm(name, &format!("{}-{}", i, n))).unwrap();
                if n % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }

    let total = PRODUCERS * PER_PRODUCER;
    tokio::time::timeout(Duration::from_secs(5), async {
        while *consumed.lock().unwrap() < total {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumers did not drain the queue");
    cancel.cancel();
    for c in consumers {
        c.await.unwrap();
    }
    assert_eq!(*consumed.lock().unwrap(), total);
    assert!(q.is_empty());
}
