use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serial_test::serial;

use super::*;
use crate::error::SessionError;
use crate::key::{ResourceKey, ResourceKind};
use crate::testing::{FakeTransport, eventually, fast_live_config, init_tracing, yield_many};

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&PushEvent) + Send + Sync>) {
	let seen = Arc::new(Mutex::new(Vec::new()));
	let make = {
		let seen = Arc::clone(&seen);
		move |label: &str| -> Box<dyn Fn(&PushEvent) + Send + Sync> {
			let seen = Arc::clone(&seen);
			let label = label.to_string();
			Box::new(move |event: &PushEvent| seen.lock().push(format!("{label}:{}:{}", event.resource, event.entity)))
		}
	};
	(seen, make)
}

async fn connected(transport: &FakeTransport, attempts: u32) -> LiveSubscriber {
	let live = LiveSubscriber::new(transport.clone(), fast_live_config(attempts));
	assert_eq!(live.connect(), ConnectOutcome::Started);
	eventually("first connection", || live.status() == LinkStatus::Connected { generation: 1 }).await;
	live
}

#[tokio::test]
async fn connect_is_idempotent_while_active() {
	init_tracing();
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;

	assert_eq!(live.connect(), ConnectOutcome::AlreadyActive);
	yield_many().await;
	assert_eq!(transport.opens(), 1);
}

#[tokio::test]
async fn events_reach_subscribers_in_registration_order() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;
	let (seen, make) = recorder();

	let _first = live.subscribe(EventFilter::any(), make("first"));
	let _second = live.subscribe(EventFilter::any(), make("second"));
	assert!(transport.emit("product.updated", r#"{"id": 7}"#));

	eventually("both callbacks", || seen.lock().len() == 2).await;
	assert_eq!(*seen.lock(), vec!["first:product:7".to_string(), "second:product:7".to_string()]);
}

#[tokio::test]
async fn filters_select_events() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;
	let (seen, make) = recorder();

	let _one = live.subscribe(EventFilter::for_key(&ResourceKey::entity(ResourceKind::Product, 1u64)), make("one"));
	let _orders = live.subscribe(EventFilter::any().resource(ResourceKind::Order).kinds([EventKind::Created]), make("orders"));

	transport.emit("product.updated", r#"{"id": 2}"#);
	transport.emit("order.updated", r#"{"id": 9}"#);
	transport.emit("order.created", r#"{"id": 10}"#);
	transport.emit("product.deleted", r#"{"id": "1"}"#);

	eventually("matching events", || seen.lock().len() == 2).await;
	yield_many().await;
	assert_eq!(*seen.lock(), vec!["orders:order:10".to_string(), "one:product:1".to_string()]);
}

#[tokio::test]
async fn dropped_subscription_stops_receiving() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;
	let (seen, make) = recorder();

	let gone = live.subscribe(EventFilter::any(), make("gone"));
	let kept = live.subscribe(EventFilter::any(), make("kept"));
	assert_eq!(live.subscription_count(), 2);
	drop(gone);
	assert_eq!(live.subscription_count(), 1);

	transport.emit("coupon.created", r#"{"id": 3}"#);
	eventually("kept callback", || seen.lock().len() == 1).await;
	assert_eq!(*seen.lock(), vec!["kept:coupon:3".to_string()]);

	assert!(kept.is_active());
	assert!(live.unsubscribe(kept));
	assert_eq!(live.subscription_count(), 0);
}

#[tokio::test]
async fn callback_may_drop_its_own_subscription() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;

	let calls = Arc::new(AtomicUsize::new(0));
	let slot: Arc<Mutex<Option<Subscription>>> = Arc::default();
	let subscription = live.subscribe(EventFilter::any(), {
		let calls = Arc::clone(&calls);
		let slot = Arc::clone(&slot);
		move |_: &PushEvent| {
			calls.fetch_add(1, Ordering::SeqCst);
			let own = slot.lock().take();
			drop(own);
		}
	});
	*slot.lock() = Some(subscription);

	transport.emit("user.updated", r#"{"id": 1}"#);
	transport.emit("user.updated", r#"{"id": 2}"#);
	eventually("self-unsubscribe", || live.subscription_count() == 0).await;
	yield_many().await;
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undecodable_messages_are_skipped() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;
	let (seen, make) = recorder();
	let _all = live.subscribe(EventFilter::any(), make("all"));

	transport.emit("garbage", "{}");
	transport.emit("product.updated", "not json");
	transport.emit("notification.status-changed", r#"{"id": 4, "read": true}"#);

	eventually("valid event", || seen.lock().len() == 1).await;
	assert_eq!(*seen.lock(), vec!["all:notification:4".to_string()]);
	assert_eq!(live.status(), LinkStatus::Connected { generation: 1 });
	assert_eq!(transport.opens(), 1);
}

#[tokio::test]
async fn gives_up_after_the_attempt_budget() {
	init_tracing();
	let transport = FakeTransport::default();
	transport.refuse_next(3);
	let live = LiveSubscriber::new(transport.clone(), fast_live_config(3));
	let mut status = live.watch_status();

	assert_eq!(live.connect(), ConnectOutcome::Started);
	eventually("exhaustion", || live.status() == LinkStatus::Disconnected).await;
	assert_eq!(transport.opens(), 3);
	assert!(live.status().is_degraded());
	assert!(status.has_changed().unwrap());
	assert_eq!(*status.borrow_and_update(), LinkStatus::Disconnected);

	yield_many().await;
	assert_eq!(transport.opens(), 3);
}

#[tokio::test]
async fn manual_connect_after_exhaustion_starts_over() {
	let transport = FakeTransport::default();
	transport.refuse_next(2);
	let live = LiveSubscriber::new(transport.clone(), fast_live_config(2));
	live.connect();
	eventually("exhaustion", || live.status() == LinkStatus::Disconnected).await;

	transport.refuse_next(1).accept_next(1);
	assert_eq!(live.connect(), ConnectOutcome::Started);
	eventually("manual reconnect", || live.status() == LinkStatus::Connected { generation: 1 }).await;
	assert_eq!(transport.opens(), 4);
}

#[tokio::test]
async fn dropped_connection_reconnects_with_new_generation() {
	let transport = FakeTransport::default();
	transport.accept_next(2);
	let live = connected(&transport, 3).await;
	let (seen, make) = recorder();
	let _all = live.subscribe(EventFilter::any(), make("all"));

	assert!(transport.hang_up());
	eventually("second connection", || live.status() == LinkStatus::Connected { generation: 2 }).await;
	assert_eq!(transport.opens(), 2);

	transport.emit("popup.created", r#"{"id": 5}"#);
	eventually("event after reconnect", || seen.lock().len() == 1).await;
}

#[tokio::test]
async fn stream_error_counts_as_disconnect() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 2).await;
	let delivered = Arc::new(AtomicUsize::new(0));
	let _count = live.subscribe(EventFilter::any(), {
		let delivered = Arc::clone(&delivered);
		move |_: &PushEvent| {
			delivered.fetch_add(1, Ordering::SeqCst);
		}
	});
	transport.emit("product.updated", r#"{"id": 1}"#);
	eventually("first event", || delivered.load(Ordering::SeqCst) == 1).await;

	assert!(transport.fail("reset by peer"));
	eventually("exhaustion", || live.status() == LinkStatus::Disconnected).await;
	assert_eq!(transport.opens(), 3);
}

#[tokio::test]
async fn flapping_endpoint_exhausts_the_budget() {
	let transport = FakeTransport::default();
	transport.flap_next(10);
	let live = LiveSubscriber::new(transport.clone(), fast_live_config(3).reconnect_delay(Duration::from_millis(50)));

	live.connect();
	eventually("exhaustion", || live.status() == LinkStatus::Disconnected).await;
	assert_eq!(transport.opens(), 3);
	assert_eq!(live.generation(), 3);
}

#[tokio::test]
async fn initial_attempts_report_connecting_not_reconnecting() {
	let transport = FakeTransport::default();
	transport.refuse_next(3);
	let live = LiveSubscriber::new(transport.clone(), fast_live_config(3).reconnect_delay(Duration::from_millis(20)));
	let mut status_rx = live.watch_status();
	let seen = tokio::spawn(async move {
		let mut seen = Vec::new();
		while status_rx.changed().await.is_ok() {
			let status = *status_rx.borrow_and_update();
			seen.push(status);
			if status == LinkStatus::Disconnected {
				break;
			}
		}
		seen
	});

	live.connect();
	let seen = seen.await.unwrap();
	assert_eq!(seen.last(), Some(&LinkStatus::Disconnected));
	assert!(!seen.iter().any(|status| matches!(status, LinkStatus::Reconnecting { .. })), "{seen:?}");
	assert_eq!(live.generation(), 0);
}

#[tokio::test]
async fn retry_after_a_stable_connection_starts_at_attempt_one() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = LiveSubscriber::new(transport.clone(), fast_live_config(3).reconnect_delay(Duration::from_millis(50)));
	let delivered = Arc::new(AtomicUsize::new(0));
	let _count = live.subscribe(EventFilter::any(), {
		let delivered = Arc::clone(&delivered);
		move |_: &PushEvent| {
			delivered.fetch_add(1, Ordering::SeqCst);
		}
	});
	live.connect();
	eventually("connection", || live.status() == LinkStatus::Connected { generation: 1 }).await;
	transport.emit("order.created", r#"{"id": 1}"#);
	eventually("event", || delivered.load(Ordering::SeqCst) == 1).await;

	transport.hang_up();
	eventually("first retry", || live.status() == LinkStatus::Reconnecting { attempt: 1 }).await;
	eventually("exhaustion", || live.status() == LinkStatus::Disconnected).await;
	assert_eq!(transport.opens(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribe_waits_for_a_running_callback() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;

	let entered = Arc::new(Barrier::new(2));
	let release = Arc::new(Barrier::new(2));
	let calls = Arc::new(AtomicUsize::new(0));
	let finished = Arc::new(AtomicBool::new(false));
	let blocking = live.subscribe(EventFilter::any(), {
		let (entered, release) = (Arc::clone(&entered), Arc::clone(&release));
		let (calls, finished) = (Arc::clone(&calls), Arc::clone(&finished));
		move |_: &PushEvent| {
			if calls.fetch_add(1, Ordering::SeqCst) == 0 {
				entered.wait();
				release.wait();
			}
			finished.store(true, Ordering::SeqCst);
		}
	});
	let sentinel = Arc::new(AtomicUsize::new(0));
	let _sentinel = live.subscribe(EventFilter::any(), {
		let sentinel = Arc::clone(&sentinel);
		move |_: &PushEvent| {
			sentinel.fetch_add(1, Ordering::SeqCst);
		}
	});

	transport.emit("product.updated", r#"{"id": 1}"#);
	tokio::task::spawn_blocking({
		let entered = Arc::clone(&entered);
		move || entered.wait()
	})
	.await
	.unwrap();

	let unsubscriber = std::thread::spawn({
		let finished = Arc::clone(&finished);
		move || {
			assert!(blocking.unsubscribe());
			finished.load(Ordering::SeqCst)
		}
	});
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert!(!unsubscriber.is_finished());

	tokio::task::spawn_blocking({
		let release = Arc::clone(&release);
		move || release.wait()
	})
	.await
	.unwrap();
	let waited = tokio::task::spawn_blocking(move || unsubscriber.join().unwrap()).await.unwrap();
	assert!(waited, "unsubscribe returned while the callback was running");

	transport.emit("product.updated", r#"{"id": 2}"#);
	eventually("sentinel saw both events", || sentinel.load(Ordering::SeqCst) == 2).await;
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(live.subscription_count(), 1);
}

#[tokio::test]
async fn shutdown_closes_for_good() {
	let transport = FakeTransport::default();
	transport.accept_next(1);
	let live = connected(&transport, 3).await;
	let (seen, make) = recorder();
	let _all = live.subscribe(EventFilter::any(), make("all"));

	live.shutdown();
	assert_eq!(live.status(), LinkStatus::Closed);
	assert_eq!(live.connect(), ConnectOutcome::Closed);

	eventually("stream released", || !transport.is_open()).await;
	transport.emit("product.updated", r#"{"id": 1}"#);
	yield_many().await;
	assert!(seen.lock().is_empty());
	assert_eq!(live.status(), LinkStatus::Closed);
}

#[test]
fn connect_without_runtime_does_nothing() {
	let live = LiveSubscriber::new(FakeTransport::default(), fast_live_config(1));
	assert_eq!(live.connect(), ConnectOutcome::NoRuntime);
	assert_eq!(live.status(), LinkStatus::Idle);
}

#[tokio::test]
#[serial]
async fn session_requires_a_factory() {
	session::reset();
	assert_eq!(session::subscriber().unwrap_err(), SessionError::NotConfigured);
	assert!(session::current().is_none());
}

#[tokio::test]
#[serial]
async fn session_builds_once_and_rebuilds_after_end() {
	session::reset();
	let built = Arc::new(AtomicUsize::new(0));
	let transport = FakeTransport::default();
	transport.accept_next(2);
	session::configure({
		let built = Arc::clone(&built);
		let transport = transport.clone();
		move || {
			built.fetch_add(1, Ordering::SeqCst);
			LiveSubscriber::new(transport.clone(), fast_live_config(1))
		}
	});

	let first = session::subscriber().unwrap();
	let again = session::subscriber().unwrap();
	let _sub = first.subscribe(EventFilter::any(), |_| {});
	assert_eq!(again.subscription_count(), 1);
	assert_eq!(built.load(Ordering::SeqCst), 1);
	eventually("session connection", || first.status() == LinkStatus::Connected { generation: 1 }).await;

	session::end();
	assert_eq!(first.status(), LinkStatus::Closed);
	assert!(session::current().is_none());

	let fresh = session::subscriber().unwrap();
	assert_eq!(built.load(Ordering::SeqCst), 2);
	assert_eq!(fresh.subscription_count(), 0);
	session::reset();
}
