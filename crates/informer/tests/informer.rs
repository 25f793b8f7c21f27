#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use mirra_core::{
    ListPage, ListWatch, Obj, SourceError, SourceEvent, SourceEventKind, WatchStream,
};
use mirra_informer::{Handler, Informer, InformerError};
use mirra_reflector::ReflectorConfig;

fn obj(name: &str, rv: &str) -> Obj {
    Obj {
        namespace: Some("ns".into()),
        name: name.into(),
        resource_version: rv.into(),
        raw: serde_json::json!({ "metadata": { "name": name, "resourceVersion": rv } }),
    }
}

/// Source that serves one list and then one always-open watch stream.
struct FakeSource {
    lists: Mutex<VecDeque<Result<ListPage, SourceError>>>,
    watch_events: Mutex<Vec<SourceEvent>>,
}

impl FakeSource {
    fn new(list: Vec<Obj>, rv: &str, watch_events: Vec<SourceEvent>) -> Arc<Self> {
        Arc::new(Self {
            lists: Mutex::new(
                vec![Ok(ListPage { items: list, resource_version: rv.into() })].into(),
            ),
            watch_events: Mutex::new(watch_events),
        })
    }

    /// A source whose first list never returns.
    fn stalled() -> Arc<Self> {
        Arc::new(Self { lists: Mutex::new(VecDeque::new()), watch_events: Mutex::new(Vec::new()) })
    }
}

#[async_trait::async_trait]
impl ListWatch for FakeSource {
    async fn list(&self, _cursor: Option<&str>) -> Result<ListPage, SourceError> {
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(r) => r,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, _cursor: &str) -> Result<WatchStream, SourceError> {
        let events: Vec<_> = self.watch_events.lock().unwrap().drain(..).collect();
        // Pace events out so the dispatcher drains between them; the
        // ordering assertions below rely on no queue-side coalescing.
        let paced = futures::stream::iter(events).then(|e| async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(e)
        });
        Ok(paced.chain(futures::stream::pending()).boxed())
    }
}

/// Records every callback as "kind key@rv".
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Handler for Recorder {
    fn on_add(&self, obj: &Obj) {
        self.seen.lock().unwrap().push(format!("add {}@{}", obj.name, obj.resource_version));
    }
    fn on_update(&self, _old: &Obj, new: &Obj) {
        self.seen.lock().unwrap().push(format!("update {}@{}", new.name, new.resource_version));
    }
    fn on_delete(&self, obj: &Obj) {
        self.seen.lock().unwrap().push(format!("delete {}@{}", obj.name, obj.resource_version));
    }
}

struct Panicker;

impl Handler for Panicker {
    fn on_add(&self, _obj: &Obj) {
        panic!("boom");
    }
    fn on_update(&self, _old: &Obj, _new: &Obj) {
        panic!("boom");
    }
    fn on_delete(&self, _obj: &Obj) {
        panic!("boom");
    }
}

fn test_config() -> ReflectorConfig {
    ReflectorConfig {
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(10),
        batch_max: 256,
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never reached");
}

#[tokio::test]
async fn handlers_see_sync_then_live_events_in_order() {
    let source = FakeSource::new(
        vec![obj("a", "1"), obj("b", "1")],
        "10",
        vec![
            SourceEvent { kind: SourceEventKind::Updated, obj: obj("a", "2") },
            SourceEvent { kind: SourceEventKind::Deleted, obj: obj("b", "3") },
        ],
    );
    let recorder = Arc::new(Recorder::default());
    let mut informer = Informer::with_config(source, test_config());
    informer.register_handler(recorder.clone()).unwrap();
    informer.start().unwrap();

    assert!(informer.wait_for_sync(Duration::from_secs(2)).await);
    wait_for(|| recorder.events().len() >= 4).await;

    let events = recorder.events();
    let mut adds: Vec<_> = events[..2].to_vec();
    adds.sort();
    assert_eq!(adds, vec!["add a@1", "add b@1"]);
    assert_eq!(&events[2..], &["update a@2", "delete b@3"]);

    let cache = informer.cache();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.list()[0].resource_version, "2");

    informer.stop().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_does_not_block_others_or_later_events() {
    let source = FakeSource::new(
        vec![obj("a", "1")],
        "10",
        vec![SourceEvent { kind: SourceEventKind::Updated, obj: obj("a", "2") }],
    );
    let recorder = Arc::new(Recorder::default());
    let mut informer = Informer::with_config(source, test_config());
    // Panicker registered first: the recorder still gets every event.
    informer.register_handler(Arc::new(Panicker)).unwrap();
    informer.register_handler(recorder.clone()).unwrap();
    informer.start().unwrap();

    assert!(informer.wait_for_sync(Duration::from_secs(2)).await);
    wait_for(|| recorder.events().len() >= 2).await;
    assert_eq!(recorder.events(), vec!["add a@1", "update a@2"]);

    informer.stop().await.unwrap();
}

#[tokio::test]
async fn wait_for_sync_times_out_when_list_never_succeeds() {
    let mut informer = Informer::with_config(FakeSource::stalled(), test_config());
    informer.start().unwrap();
    assert!(!informer.wait_for_sync(Duration::from_millis(50)).await);
    informer.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected() {
    let mut informer = Informer::with_config(FakeSource::stalled(), test_config());
    assert!(matches!(informer.stop().await, Err(InformerError::NotStarted)));
    informer.start().unwrap();
    assert!(matches!(informer.start(), Err(InformerError::AlreadyStarted)));
    assert!(matches!(
        informer.register_handler(Arc::new(Recorder::default())),
        Err(InformerError::AlreadyStarted)
    ));
    informer.stop().await.unwrap();
}

#[tokio::test]
async fn zero_batch_max_is_a_fatal_config_error() {
    let config = ReflectorConfig { batch_max: 0, ..test_config() };
    let mut informer = Informer::with_config(FakeSource::stalled(), config);
    assert!(matches!(informer.start(), Err(InformerError::FatalConfig(_))));
}

#[tokio::test]
async fn consumers_read_cache_through_the_view_only() {
    let source = FakeSource::new(vec![obj("a", "1")], "10", vec![]);
    let mut informer = Informer::with_config(source, test_config());
    informer.start().unwrap();
    assert!(informer.wait_for_sync(Duration::from_secs(2)).await);

    let cache = informer.cache();
    let key = obj("a", "1").key();
    assert_eq!(cache.get(&key).unwrap().name, "a");
    assert!(!cache.is_empty());

    informer.stop().await.unwrap();
}
