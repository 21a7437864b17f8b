use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ks_core::config::TickerConfig;
use ks_runtime::ticker::{TickListener, Ticker, TickerError};

#[derive(Default)]
struct Recorder {
    ticks: Mutex<Vec<u64>>,
}

impl Recorder {
    fn ticks(&self) -> Vec<u64> {
        self.ticks.lock().unwrap().clone()
    }
}

impl TickListener for Recorder {
    fn on_tick(&self, count: u64) {
        self.ticks.lock().unwrap().push(count);
    }
}

struct Panicker;

impl TickListener for Panicker {
    fn on_tick(&self, _count: u64) {
        panic!("listener exploded");
    }
}

fn config(interval_ms: u64, span_ms: u64) -> TickerConfig {
    TickerConfig {
        interval_ms,
        span_ms,
    }
}

fn ticker() -> Arc<Ticker> {
    Ticker::new(&config(500, 3_600_000)).expect("valid config")
}

#[test]
fn counter_increases_by_one_per_firing() {
    let ticker = ticker();
    let rec = Arc::new(Recorder::default());
    ticker.register(&rec);

    assert_eq!(ticker.count(), 0);
    for expected in 1..=5 {
        let report = ticker.fire();
        assert_eq!(report.count, expected);
        assert_eq!(report.notified, 1);
    }
    assert_eq!(rec.ticks(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn registering_twice_notifies_once() {
    let ticker = ticker();
    let rec = Arc::new(Recorder::default());
    assert!(ticker.register(&rec));
    assert!(!ticker.register(&rec));
    assert_eq!(ticker.listener_count(), 1);

    ticker.fire();
    assert_eq!(rec.ticks(), vec![1]);
}

#[test]
fn dropped_listener_is_swept_and_not_notified() {
    let ticker = ticker();
    let l1 = Arc::new(Recorder::default());
    let l2 = Arc::new(Recorder::default());
    ticker.register(&l1);
    ticker.register(&l2);

    let first = ticker.fire();
    assert_eq!(first.notified, 2);
    assert_eq!(l1.ticks(), vec![1]);
    assert_eq!(l2.ticks(), vec![1]);

    // Keep a weak handle only to prove the listener is really gone.
    let l1_weak = Arc::downgrade(&l1);
    drop(l1);
    assert!(l1_weak.upgrade().is_none());
    assert_eq!(ticker.listener_count(), 2, "sweep happens on the next tick");

    let second = ticker.fire();
    assert_eq!(second.count, 2);
    assert_eq!(second.pruned, 1);
    assert_eq!(second.notified, 1);
    assert_eq!(l2.ticks(), vec![1, 2]);
    assert_eq!(ticker.listener_count(), 1);
}

#[test]
fn unregister_removes_listener() {
    let ticker = ticker();
    let keep = Arc::new(Recorder::default());
    let gone = Arc::new(Recorder::default());
    ticker.register(&keep);
    ticker.register(&gone);

    assert!(ticker.unregister(gone.as_ref()));
    assert!(!ticker.unregister(gone.as_ref()));
    ticker.fire();

    assert_eq!(keep.ticks(), vec![1]);
    assert!(gone.ticks().is_empty());
}

#[test]
fn stop_clears_registry_and_silences_ticks() {
    let ticker = ticker();
    let rec = Arc::new(Recorder::default());
    ticker.register(&rec);
    ticker.fire();

    ticker.stop();
    assert_eq!(ticker.listener_count(), 0);
    assert!(ticker.is_stopped());

    let report = ticker.fire();
    assert_eq!(report.count, 1, "counter frozen after stop");
    assert_eq!(report.notified, 0);

    assert!(!ticker.register(&rec), "registration after stop is ignored");
    assert_eq!(ticker.listener_count(), 0);
    assert_eq!(rec.ticks(), vec![1]);

    // Stopping again is harmless.
    ticker.stop();
}

#[test]
fn panicking_listener_does_not_block_others() {
    let ticker = ticker();
    let bad = Arc::new(Panicker);
    let good = Arc::new(Recorder::default());
    ticker.register(&bad);
    ticker.register(&good);

    let report = ticker.fire();
    assert_eq!(report.failed, 1);
    assert_eq!(report.notified, 1);
    assert_eq!(good.ticks(), vec![1]);

    // The failing listener stays registered and the ticker keeps working.
    let report = ticker.fire();
    assert_eq!(report.count, 2);
    assert_eq!(good.ticks(), vec![1, 2]);
    assert_eq!(ticker.listener_count(), 2);
}

struct SelfRemoving {
    ticker: Arc<Ticker>,
    calls: AtomicUsize,
}

impl TickListener for SelfRemoving {
    fn on_tick(&self, _count: u64) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ticker.unregister(self);
    }
}

#[test]
fn listener_can_unregister_itself_during_tick() {
    let ticker = ticker();
    let listener = Arc::new(SelfRemoving {
        ticker: Arc::clone(&ticker),
        calls: AtomicUsize::new(0),
    });
    ticker.register(&listener);

    ticker.fire();
    ticker.fire();
    assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ticker.listener_count(), 0);
}

#[test]
fn subscription_unregisters_on_drop() {
    let ticker = ticker();
    let rec = Arc::new(Recorder::default());
    {
        let _sub = ticker.subscribe(&rec);
        ticker.fire();
        assert_eq!(ticker.listener_count(), 1);
    }
    assert_eq!(ticker.listener_count(), 0);
    ticker.fire();
    assert_eq!(rec.ticks(), vec![1]);
}

#[test]
fn concurrent_registration_during_firing() {
    let ticker = ticker();
    let listeners: Vec<Arc<Recorder>> = (0..64).map(|_| Arc::new(Recorder::default())).collect();

    let firing = {
        let ticker = Arc::clone(&ticker);
        std::thread::spawn(move || {
            for _ in 0..200 {
                ticker.fire();
            }
        })
    };
    let registrars: Vec<_> = listeners
        .chunks(16)
        .map(|chunk| {
            let ticker = Arc::clone(&ticker);
            let chunk: Vec<_> = chunk.to_vec();
            std::thread::spawn(move || {
                for l in &chunk {
                    ticker.register(l);
                    ticker.register(l);
                }
            })
        })
        .collect();

    firing.join().unwrap();
    for r in registrars {
        r.join().unwrap();
    }

    assert_eq!(ticker.count(), 200);
    assert_eq!(ticker.listener_count(), 64);
    for l in &listeners {
        let ticks = l.ticks();
        assert!(ticks.windows(2).all(|w| w[0] < w[1]), "strictly increasing");
    }
}

#[test]
fn start_without_runtime_fails() {
    let ticker = ticker();
    assert!(matches!(ticker.start(), Err(TickerError::NoRuntime)));
    assert!(!ticker.is_running());
}

#[tokio::test(start_paused = true)]
async fn start_fires_on_interval() {
    let ticker = Ticker::new(&config(500, 3_600_000)).unwrap();
    let rec = Arc::new(Recorder::default());
    ticker.register(&rec);
    ticker.start().unwrap();
    assert!(ticker.is_running());

    tokio::time::sleep(Duration::from_millis(2_250)).await;
    assert_eq!(rec.ticks(), vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn counter_survives_span_renewal() {
    // 4 ticks per span.
    let ticker = Ticker::new(&config(500, 2_000)).unwrap();
    let rec = Arc::new(Recorder::default());
    ticker.register(&rec);
    ticker.start().unwrap();

    tokio::time::sleep(Duration::from_millis(5_250)).await;

    assert_eq!(ticker.count(), 10);
    assert_eq!(ticker.renewals(), 2);
    assert_eq!(rec.ticks(), (1..=10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn stop_halts_timer() {
    let ticker = Ticker::new(&config(100, 1_000)).unwrap();
    let rec = Arc::new(Recorder::default());
    ticker.register(&rec);
    ticker.start().unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    ticker.stop();
    let frozen = ticker.count();
    assert_eq!(frozen, 3);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(ticker.count(), frozen);
    assert_eq!(rec.ticks(), vec![1, 2, 3]);
    assert!(!ticker.is_running());
}

#[tokio::test]
async fn start_twice_and_after_stop_fail() {
    let ticker = ticker();
    ticker.start().unwrap();
    assert!(matches!(ticker.start(), Err(TickerError::AlreadyStarted)));

    let stopped = Ticker::new(&config(500, 500)).unwrap();
    stopped.stop();
    assert!(matches!(stopped.start(), Err(TickerError::Stopped)));
}
