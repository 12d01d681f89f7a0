// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios over real sockets.
//!
//! Each test runs its own partition so concurrent tests sharing the
//! discovery group never see each other. Cross-process scenarios run
//! as two runtimes in one test process; each runtime has its own
//! process UUID, sockets, and threads, so the wire paths exercised
//! are the same as between OS processes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Node, Runtime};
use crate::config::Config;
use crate::core::guid::Uuid;
use crate::core::types::Scope;
use crate::error::Error;
use crate::payload::msgs::{Empty, Int32, Text, Vector3d};
use crate::payload::Payload;

fn unique_partition(tag: &str) -> String {
    format!("{}-{}", tag, Uuid::generate())
}

fn runtime(partition: &str) -> Runtime {
    Runtime::with_config(Config::loopback(partition)).expect("runtime should start")
}

/// Poll a predicate with a deadline.
fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

// ===== Same-process scenarios =====

#[test]
fn same_process_echo_service() {
    let rt = runtime(&unique_partition("echo"));
    let node = Node::new(&rt);

    node.advertise_service("/foo", |req: &Int32| Ok(Int32::new(req.data)))
        .expect("advertise_service should succeed");

    let rep: Int32 = node
        .request("/foo", &Int32::new(5), Duration::from_millis(1000))
        .expect("same-process echo should succeed");
    assert_eq!(rep.data, 5);
}

#[test]
fn unknown_service_times_out_within_bounds() {
    let rt = runtime(&unique_partition("unknown"));
    let node = Node::new(&rt);

    let start = Instant::now();
    let result = node.request::<Int32, Int32>(
        "unknown_service",
        &Int32::new(5),
        Duration::from_millis(500),
    );
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(elapsed >= Duration::from_millis(500), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "returned late: {:?}", elapsed);
}

#[test]
fn local_pubsub_preserves_publish_order() {
    let rt = runtime(&unique_partition("order"));
    let node = Node::new(&rt);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    node.subscribe("/seq", move |msg: &Int32| sink.lock().push(msg.data))
        .expect("subscribe should succeed");
    node.advertise::<Int32>("/seq", Scope::All)
        .expect("advertise should succeed");

    for i in 0..100 {
        node.publish("/seq", &Int32::new(i)).expect("publish should succeed");
    }

    // Same-process delivery is synchronous on the publisher thread.
    let got = received.lock().clone();
    assert_eq!(got, (0..100).collect::<Vec<_>>());
}

#[test]
fn publish_demands_prior_advertise_and_matching_type() {
    let rt = runtime(&unique_partition("adv"));
    let node = Node::new(&rt);

    assert!(matches!(
        node.publish("/nope", &Int32::new(1)),
        Err(Error::NotAdvertised(_))
    ));

    node.advertise::<Int32>("/t", Scope::All).expect("advertise");
    // no subscribers anywhere: a successful no-op
    node.publish("/t", &Int32::new(1)).expect("publish without subscribers");
    // advertised type is enforced
    assert!(matches!(
        node.publish("/t", &Text::new("oops")),
        Err(Error::TypeMismatch)
    ));
}

#[test]
fn resubscribe_with_same_signature_is_a_noop() {
    let rt = runtime(&unique_partition("resub"));
    let node = Node::new(&rt);

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let sink = Arc::clone(&hits);
        node.subscribe("/t", move |_msg: &Int32| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe should succeed");
    }
    node.advertise::<Int32>("/t", Scope::All).expect("advertise");
    node.publish("/t", &Int32::new(1)).expect("publish");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn mismatched_handler_type_is_skipped() {
    let rt = runtime(&unique_partition("skip"));
    let node = Node::new(&rt);

    let wrong = Arc::new(AtomicUsize::new(0));
    let right = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&wrong);
    node.subscribe("/t", move |_msg: &Vector3d| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .expect("subscribe should succeed");
    let sink = Arc::clone(&right);
    node.subscribe("/t", move |_msg: &Int32| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .expect("subscribe should succeed");

    node.advertise::<Int32>("/t", Scope::All).expect("advertise");
    node.publish("/t", &Int32::new(7)).expect("publish");

    assert_eq!(right.load(Ordering::SeqCst), 1);
    assert_eq!(wrong.load(Ordering::SeqCst), 0);
}

#[test]
fn unsubscribe_stops_delivery() {
    let rt = runtime(&unique_partition("unsub"));
    let node = Node::new(&rt);

    let hits = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&hits);
    node.subscribe("/t", move |_msg: &Int32| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
    .expect("subscribe");
    node.advertise::<Int32>("/t", Scope::All).expect("advertise");

    node.publish("/t", &Int32::new(1)).expect("publish");
    node.unsubscribe("/t").expect("unsubscribe");
    node.publish("/t", &Int32::new(2)).expect("publish");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// A subscription callback that publishes, and a second hop behind
/// it. Regression test for the lock discipline: handlers run outside
/// the dataplane lock, so a relay cannot deadlock.
#[test]
fn relay_callback_may_publish() {
    let rt = runtime(&unique_partition("relay"));
    let relay = Arc::new(Node::new(&rt));
    let probe = Node::new(&rt);

    relay
        .advertise::<Int32>("/reply", Scope::All)
        .expect("advertise reply");
    let relay_clone = Arc::clone(&relay);
    relay
        .subscribe("/request", move |msg: &Int32| {
            relay_clone
                .publish("/reply", &Int32::new(msg.data * 2))
                .expect("relay publish");
        })
        .expect("subscribe request");

    let hits = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hits);
    probe
        .subscribe("/reply", move |msg: &Int32| sink.lock().push(msg.data))
        .expect("subscribe reply");
    probe
        .advertise::<Int32>("/request", Scope::All)
        .expect("advertise request");

    probe.publish("/request", &Int32::new(21)).expect("publish");
    assert_eq!(hits.lock().clone(), vec![42]);
}

#[test]
fn service_handler_failure_reports_service_failure() {
    let rt = runtime(&unique_partition("fail"));
    let node = Node::new(&rt);

    node.advertise_service("/always-fails", |_req: &Int32| -> crate::Result<Int32> {
        Err(Error::ServiceFailure)
    })
    .expect("advertise_service");

    let result = node.request::<Int32, Int32>(
        "/always-fails",
        &Int32::new(1),
        Duration::from_millis(500),
    );
    assert!(matches!(result, Err(Error::ServiceFailure)));
}

#[test]
fn no_output_service_round_trip() {
    let rt = runtime(&unique_partition("nooutput"));
    let node = Node::new(&rt);

    let served = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&served);
    node.advertise_service("/fire", move |req: &Int32| {
        sink.fetch_add(req.data as usize, Ordering::SeqCst);
        Ok(Empty)
    })
    .expect("advertise_service");

    let _rep: Empty = node
        .request("/fire", &Int32::new(3), Duration::from_millis(1000))
        .expect("no-output request should succeed");
    assert_eq!(served.load(Ordering::SeqCst), 3);
}

#[test]
fn runtime_shutdown_rejects_new_operations() {
    let rt = runtime(&unique_partition("shutdown"));
    let node = Node::new(&rt);
    node.advertise::<Int32>("/t", Scope::All).expect("advertise");
    drop(rt);

    assert!(matches!(
        node.publish("/t", &Int32::new(1)),
        Err(Error::ShutdownInProgress)
    ));
    assert!(matches!(
        node.request::<Int32, Int32>("/t", &Int32::new(1), Duration::from_millis(10)),
        Err(Error::ShutdownInProgress)
    ));
}

// ===== Cross-runtime scenarios (loopback multicast) =====

#[test]
fn sync_echo_across_runtimes() {
    let partition = unique_partition("xecho");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let replier = Node::new(&rt_a);
    replier
        .advertise_service("/foo", |req: &Int32| Ok(Int32::new(req.data)))
        .expect("advertise_service");

    let requester = Node::new(&rt_b);
    let rep: Int32 = requester
        .request("/foo", &Int32::new(5), Duration::from_millis(5000))
        .expect("cross-runtime echo should succeed");
    assert_eq!(rep.data, 5);

    // With the endpoint already discovered, a second call is quick.
    let start = Instant::now();
    let rep: Int32 = requester
        .request("/foo", &Int32::new(7), Duration::from_millis(5000))
        .expect("second request should succeed");
    assert_eq!(rep.data, 7);
    assert!(start.elapsed() < Duration::from_millis(2000));
}

#[test]
fn no_input_service_called_twice() {
    let partition = unique_partition("noinput");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let replier = Node::new(&rt_a);
    replier
        .advertise_service("/foo", |_req: &Empty| Ok(Int32::new(5)))
        .expect("advertise_service");

    let requester = Node::new(&rt_b);
    let counter = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(Mutex::new(None));

    for round in 0..2 {
        counter.store(0, Ordering::SeqCst);
        *last.lock() = None;

        let c = Arc::clone(&counter);
        let l = Arc::clone(&last);
        requester
            .request_no_input_async("/foo", move |rep: crate::Result<Int32>| {
                if let Ok(rep) = rep {
                    *l.lock() = Some(rep.data);
                }
                c.fetch_add(1, Ordering::SeqCst);
            })
            .expect("async submit should succeed");

        assert!(
            wait_until(Duration::from_millis(5000), || {
                counter.load(Ordering::SeqCst) == 1
            }),
            "round {}: callback did not fire",
            round
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock(), Some(5));
    }
}

#[test]
fn wrong_response_type_never_reaches_the_callback() {
    let partition = unique_partition("wrongrep");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let replier = Node::new(&rt_a);
    replier
        .advertise_service("/foo", |_req: &Empty| Ok(Int32::new(5)))
        .expect("advertise_service");

    let requester = Node::new(&rt_b);

    // Positive control: the service is reachable with the right type.
    let rep: Int32 = requester
        .request_no_input("/foo", Duration::from_millis(5000))
        .expect("well-typed request should succeed");
    assert_eq!(rep.data, 5);

    // Synchronous request with the wrong response type fails.
    let result =
        requester.request_no_input::<Vector3d>("/foo", Duration::from_millis(2000));
    assert!(result.is_err());

    // Asynchronous request with the wrong response type: the typed
    // callback is never invoked, with any outcome.
    let invoked = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&invoked);
    requester
        .request_no_input_async("/foo", move |_rep: crate::Result<Vector3d>| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .expect("async submit should succeed");
    std::thread::sleep(Duration::from_millis(1000));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[test]
fn service_list_converges_and_second_call_is_fast() {
    let partition = unique_partition("svclist");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let replier = Node::new(&rt_a);
    replier
        .advertise_service("/foo", |_req: &Empty| Ok(Int32::new(5)))
        .expect("advertise_service");

    let observer = Node::new(&rt_b);
    // Warm-up window for discovery convergence.
    std::thread::sleep(Duration::from_millis(2500));

    let services = observer.service_list();
    assert_eq!(services, vec!["/foo".to_string()]);

    let start = Instant::now();
    let services = observer.service_list();
    let elapsed = start.elapsed();
    assert_eq!(services, vec!["/foo".to_string()]);
    assert!(elapsed < Duration::from_millis(10), "second call took {:?}", elapsed);

    let info = observer.service_info("/foo");
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].req_type_name(), Empty::type_name());
    assert_eq!(info[0].rep_type_name(), Int32::type_name());
    assert!(observer.service_info("/bogus").is_empty());
}

#[test]
fn cross_runtime_pubsub_delivers_in_order() {
    let partition = unique_partition("xpub");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let publisher = Node::new(&rt_a);
    publisher
        .advertise::<Int32>("/chatter", Scope::All)
        .expect("advertise");

    let subscriber = Node::new(&rt_b);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    subscriber
        .subscribe("/chatter", move |msg: &Int32| sink.lock().push(msg.data))
        .expect("subscribe");

    // Publish until the dataplane connection is up and delivering.
    let mut i = 0;
    let delivered = wait_until(Duration::from_millis(10_000), || {
        publisher
            .publish("/chatter", &Int32::new(i))
            .expect("publish");
        i += 1;
        received.lock().len() >= 5
    });
    assert!(delivered, "no cross-runtime delivery");

    // Per-publisher order: consecutive values step by one from
    // whatever message the subscriber joined at.
    let got = received.lock().clone();
    for pair in got.windows(2) {
        assert_eq!(pair[1], pair[0] + 1, "out of order: {:?}", got);
    }
}

#[test]
fn readvertise_after_unadvertise_looks_fresh_to_late_subscribers() {
    let partition = unique_partition("readv");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let publisher = Node::new(&rt_a);
    publisher.advertise::<Int32>("/re", Scope::All).expect("advertise");
    publisher.unadvertise("/re").expect("unadvertise");
    publisher.advertise::<Int32>("/re", Scope::All).expect("re-advertise");

    let subscriber = Node::new(&rt_b);
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&hits);
    subscriber
        .subscribe("/re", move |_msg: &Int32| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");

    let delivered = wait_until(Duration::from_millis(10_000), || {
        publisher.publish("/re", &Int32::new(1)).expect("publish");
        hits.load(Ordering::SeqCst) >= 1
    });
    assert!(delivered, "late subscriber saw no deliveries");
}

#[test]
fn process_scope_is_invisible_across_runtimes() {
    let partition = unique_partition("scope");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let publisher = Node::new(&rt_a);
    publisher
        .advertise::<Int32>("/vis", Scope::All)
        .expect("advertise /vis");
    publisher
        .advertise::<Int32>("/hidden", Scope::Process)
        .expect("advertise /hidden");

    let subscriber = Node::new(&rt_b);
    let vis = Arc::new(AtomicUsize::new(0));
    let hidden = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&vis);
    subscriber
        .subscribe("/vis", move |_msg: &Int32| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe /vis");
    let sink = Arc::clone(&hidden);
    subscriber
        .subscribe("/hidden", move |_msg: &Int32| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe /hidden");

    let delivered = wait_until(Duration::from_millis(10_000), || {
        publisher.publish("/vis", &Int32::new(1)).expect("publish /vis");
        publisher
            .publish("/hidden", &Int32::new(2))
            .expect("publish /hidden");
        vis.load(Ordering::SeqCst) >= 3
    });
    assert!(delivered, "control topic never delivered");
    assert_eq!(hidden.load(Ordering::SeqCst), 0);
}

#[test]
fn different_partitions_are_mutually_invisible() {
    let rt_a = runtime(&unique_partition("part-a"));
    let rt_b = runtime(&unique_partition("part-b"));

    let publisher = Node::new(&rt_a);
    publisher
        .advertise::<Int32>("/secret", Scope::All)
        .expect("advertise");

    let observer = Node::new(&rt_b);
    // Two heartbeat periods are plenty for the advertisement to have
    // crossed the group if it were going to.
    std::thread::sleep(Duration::from_millis(2500));
    assert!(observer.topic_list().is_empty());
    assert!(observer.service_list().is_empty());
}

#[test]
fn topic_list_sees_remote_topics() {
    let partition = unique_partition("tlist");
    let rt_a = runtime(&partition);
    let rt_b = runtime(&partition);

    let publisher = Node::new(&rt_a);
    publisher.advertise::<Int32>("/a", Scope::All).expect("advertise");
    publisher.advertise::<Int32>("/b", Scope::All).expect("advertise");

    let observer = Node::new(&rt_b);
    let converged = wait_until(Duration::from_millis(5000), || {
        observer.topic_list() == vec!["/a".to_string(), "/b".to_string()]
    });
    assert!(converged, "topic list never converged: {:?}", observer.topic_list());
}
