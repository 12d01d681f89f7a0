// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Latency / throughput benchmark.
//!
//! Usage: `bench <options>`
//!
//! - `-l` latency test
//! - `-t` throughput test
//! - `-p` publishing side
//! - `-r` relay side
//! - `-i N` iterations per message size (default 1000)
//!
//! Choose one of `-l`/`-t`, and one (or none, for in-process testing)
//! of `-p`/`-r`. The relay echoes `/benchmark/latency/request` onto
//! `/benchmark/latency/reply` (same for throughput); the publisher
//! measures the half round-trip across the message size ladder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use meshbus::msgs::Blob;
use meshbus::{Node, Runtime, Scope};

const LATENCY_REQ: &str = "/benchmark/latency/request";
const LATENCY_REP: &str = "/benchmark/latency/reply";
const THROUGHPUT_REQ: &str = "/benchmark/throughput/request";
const THROUGHPUT_REP: &str = "/benchmark/throughput/reply";

/// The message size ladder, in bytes.
const SIZES: &[usize] = &[
    256, 512, 1000, 2000, 4000, 8000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000,
    1_000_000, 2_000_000, 4_000_000,
];

/// Subscribes to the request topics and echoes every message on the
/// corresponding reply topic.
struct ReplyTester {
    _node: Arc<Node>,
}

impl ReplyTester {
    fn new(runtime: &Runtime) -> meshbus::Result<Self> {
        let node = Arc::new(Node::new(runtime));

        node.advertise::<Blob>(LATENCY_REP, Scope::All)?;
        node.advertise::<Blob>(THROUGHPUT_REP, Scope::All)?;

        let relay = Arc::clone(&node);
        node.subscribe(LATENCY_REQ, move |msg: &Blob| {
            if let Err(e) = relay.publish(LATENCY_REP, msg) {
                eprintln!("relay publish failed: {}", e);
            }
        })?;
        let relay = Arc::clone(&node);
        node.subscribe(THROUGHPUT_REQ, move |msg: &Blob| {
            if let Err(e) = relay.publish(THROUGHPUT_REP, msg) {
                eprintln!("relay publish failed: {}", e);
            }
        })?;

        // Kick discovery.
        let _ = node.topic_list();
        Ok(Self { _node: node })
    }
}

#[derive(Default)]
struct ReplyState {
    replies: usize,
    /// Reception time of the latest reply, written by the reception
    /// thread under the same mutex the waiter reads it under.
    time_end: Option<Instant>,
}

struct Waiter {
    state: Mutex<ReplyState>,
    cv: Condvar,
}

/// Publishes on the request topics and measures the echoed replies.
struct PubTester {
    node: Arc<Node>,
    latency: Arc<Waiter>,
    throughput: Arc<Waiter>,
    iterations: usize,
}

impl PubTester {
    fn new(runtime: &Runtime, iterations: usize) -> meshbus::Result<Self> {
        let node = Arc::new(Node::new(runtime));

        node.advertise::<Blob>(LATENCY_REQ, Scope::All)?;
        node.advertise::<Blob>(THROUGHPUT_REQ, Scope::All)?;

        let latency = Arc::new(Waiter {
            state: Mutex::new(ReplyState::default()),
            cv: Condvar::new(),
        });
        let throughput = Arc::new(Waiter {
            state: Mutex::new(ReplyState::default()),
            cv: Condvar::new(),
        });

        let waiter = Arc::clone(&latency);
        node.subscribe(LATENCY_REP, move |_msg: &Blob| {
            let mut state = waiter.state.lock();
            state.replies += 1;
            state.time_end = Some(Instant::now());
            waiter.cv.notify_one();
        })?;
        let waiter = Arc::clone(&throughput);
        node.subscribe(THROUGHPUT_REP, move |_msg: &Blob| {
            let mut state = waiter.state.lock();
            state.replies += 1;
            state.time_end = Some(Instant::now());
            waiter.cv.notify_one();
        })?;

        let _ = node.topic_list();
        Ok(Self {
            node,
            latency,
            throughput,
            iterations,
        })
    }

    /// Average one-way latency per message size: half the measured
    /// round-trip through the relay.
    fn latency(&self) -> meshbus::Result<()> {
        println!("# size(B)  latency(us)");
        for &size in SIZES {
            let msg = Blob::zeroed(size);
            let mut total = Duration::ZERO;
            let mut completed = 0usize;

            for _ in 0..self.iterations {
                let start = {
                    let mut state = self.latency.state.lock();
                    state.replies = 0;
                    state.time_end = None;
                    Instant::now()
                };
                self.node.publish(LATENCY_REQ, &msg)?;

                let mut state = self.latency.state.lock();
                while state.replies == 0 {
                    if self.cv_wait(&self.latency, &mut state) {
                        break;
                    }
                }
                if let Some(end) = state.time_end {
                    total += end.duration_since(start);
                    completed += 1;
                }
            }

            if completed == 0 {
                eprintln!("# no replies for size {}", size);
                continue;
            }
            let half_us = total.as_micros() as f64 / (2.0 * completed as f64);
            println!("{:>9}  {:>11.2}", size, half_us);
        }
        Ok(())
    }

    /// Throughput per message size: N messages through the relay,
    /// half the round-trip wall time.
    fn throughput(&self) -> meshbus::Result<()> {
        println!("# size(B)  MB/s  kmsg/s");
        for &size in SIZES {
            let msg = Blob::zeroed(size);
            {
                let mut state = self.throughput.state.lock();
                state.replies = 0;
                state.time_end = None;
            }

            let start = Instant::now();
            for _ in 0..self.iterations {
                self.node.publish(THROUGHPUT_REQ, &msg)?;
            }

            let mut state = self.throughput.state.lock();
            while state.replies < self.iterations {
                if self.cv_wait(&self.throughput, &mut state) {
                    break;
                }
            }
            let end = state.time_end.unwrap_or_else(Instant::now);
            drop(state);

            let half = end.duration_since(start).as_secs_f64() / 2.0;
            if half <= 0.0 {
                continue;
            }
            let megabytes = (size * self.iterations) as f64 / 1.0e6;
            let kmsgs = self.iterations as f64 / 1000.0;
            println!(
                "{:>9}  {:>8.2}  {:>7.2}",
                size,
                megabytes / half,
                kmsgs / half
            );
        }
        Ok(())
    }

    /// Wait one bounded interval; true means give up on this message.
    fn cv_wait(&self, waiter: &Waiter, state: &mut parking_lot::MutexGuard<'_, ReplyState>) -> bool {
        waiter
            .cv
            .wait_for(state, Duration::from_secs(5))
            .timed_out()
    }
}

fn usage() -> ! {
    eprintln!("usage: bench [-l | -t] [-p | -r] [-i N]");
    std::process::exit(1)
}

fn main() -> meshbus::Result<()> {
    let mut latency = false;
    let mut throughput = false;
    let mut publisher = false;
    let mut relay = false;
    let mut iterations = 1000usize;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-l" => latency = true,
            "-t" => throughput = true,
            "-p" => publisher = true,
            "-r" => relay = true,
            "-i" => {
                iterations = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            "-h" | "--help" => usage(),
            other => {
                eprintln!("unknown option {}", other);
                usage();
            }
        }
    }
    if !(latency ^ throughput) || (publisher && relay) {
        usage();
    }

    let runtime = Runtime::new()?;

    if relay {
        let _reply = ReplyTester::new(&runtime)?;
        eprintln!("# relay up, ctrl-c to stop");
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    // In-process mode hosts the relay next to the publisher.
    let _local_relay = if publisher {
        // Remote relay: give discovery a moment to converge.
        std::thread::sleep(Duration::from_millis(2000));
        None
    } else {
        Some(ReplyTester::new(&runtime)?)
    };

    let tester = PubTester::new(&runtime, iterations)?;
    if latency {
        tester.latency()?;
    } else {
        tester.throughput()?;
    }
    Ok(())
}
