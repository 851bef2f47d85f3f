//! Integration Tests for the Computation Graph
//!
//! These tests verify that stored nodes, computed nodes, and registrations
//! work together correctly.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use futures_util::StreamExt;
use parking_lot::Mutex;

use trellis_core::{
    Backend, BackendError, Codec, Computed, Graph, GraphConfig, GraphError, KeyValueStore,
    KeyedBackend, MemoryStore,
};

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (count.clone(), count)
}

/// Writing a stored node and reading a derived node gives the new value,
/// with the rule invoked exactly twice.
#[test]
fn derived_value_follows_write() {
    let graph = Graph::new();
    let (calls, calls_in_rule) = counter();

    let a = graph.stored("a", 1);
    let a_in_rule = a.clone();
    let b = graph.computed("b", move || {
        calls_in_rule.fetch_add(1, Ordering::SeqCst);
        a_in_rule.read() * 2
    });

    assert_eq!(b.read(), 2);
    a.write(5);
    assert_eq!(b.read(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Reads of a clean node never invoke its rule.
#[test]
fn clean_reads_use_cache() {
    let graph = Graph::new();
    let a = graph.stored("a", 3);
    let a_in_rule = a.clone();
    let b = graph.computed("b", move || a_in_rule.read() + 1);

    for _ in 0..10 {
        assert_eq!(b.read(), 4);
    }
    assert_eq!(b.recompute_count(), 1);
    assert!(!b.is_potentially_dirty());
}

/// A write reaches the end of a chain even though only the first link is
/// flagged eagerly.
#[test]
fn write_reaches_end_of_chain() {
    let graph = Graph::new();
    let a = graph.stored("a", 1);

    let a_in_rule = a.clone();
    let b = graph.computed("b", move || a_in_rule.read() + 1);
    let b_in_rule = b.clone();
    let c = graph.computed("c", move || b_in_rule.read() * 10);

    assert_eq!(c.read(), 20);
    a.write(4);

    assert!(b.is_potentially_dirty());
    assert!(c.is_potentially_dirty());
    assert_eq!(c.read(), 50);
    assert_eq!(b.recompute_count(), 2);
    assert_eq!(c.recompute_count(), 2);
}

/// The branch a rule did not take is not a dependency, and switching
/// branches moves the edges.
#[test]
fn conditional_dependencies_follow_branch() {
    let graph = Graph::new();
    let cond = graph.stored("cond", true);
    let x = graph.stored("x", 1);
    let y = graph.stored("y", 2);

    let (cond_r, x_r, y_r) = (cond.clone(), x.clone(), y.clone());
    let c = graph.computed("c", move || {
        if cond_r.read() {
            x_r.read()
        } else {
            y_r.read()
        }
    });

    assert_eq!(c.read(), 1);
    assert_eq!(c.dependencies(), vec![cond.id(), x.id()]);
    assert!(y.dependents().is_empty());

    y.write(99);
    assert!(!c.is_potentially_dirty());
    assert_eq!(c.read(), 1);
    assert_eq!(c.recompute_count(), 1);

    cond.write(false);
    assert_eq!(c.read(), 99);
    assert_eq!(c.dependencies(), vec![cond.id(), y.id()]);
    assert!(x.dependents().is_empty());
    assert_eq!(y.dependents(), vec![c.id()]);

    y.write(100);
    assert_eq!(c.read(), 100);

    // x is no longer read, so writing it costs nothing.
    x.write(7);
    assert!(!c.is_potentially_dirty());
    assert_eq!(c.recompute_count(), 3);
}

/// Disjoint subgraphs do not disturb each other.
#[test]
fn independent_subgraphs_stay_independent() {
    let graph = Graph::new();
    let left = graph.stored("left", 1);
    let right = graph.stored("right", 1);

    let l = left.clone();
    let left_sum = graph.computed("left_sum", move || l.read() + 1);
    let r = right.clone();
    let right_sum = graph.computed("right_sum", move || r.read() + 1);

    left_sum.read();
    right_sum.read();

    for i in 0..5 {
        left.write(i);
        left_sum.read();
        right_sum.read();
    }

    assert_eq!(left_sum.recompute_count(), 6);
    assert_eq!(right_sum.recompute_count(), 1);
}

/// A node read twice in one rule gets one edge.
#[test]
fn repeated_reads_make_one_edge() {
    let graph = Graph::new();
    let a = graph.stored("a", 2);
    let a_in_rule = a.clone();
    let square = graph.computed("square", move || a_in_rule.read() * a_in_rule.read());

    assert_eq!(square.read(), 4);
    assert_eq!(square.dependencies(), vec![a.id()]);
    assert_eq!(graph.stats().edges, 1);
}

/// Diamond: both paths see the write and the bottom recomputes once.
#[test]
fn diamond_recomputes_bottom_once() {
    let graph = Graph::new();
    let top = graph.stored("top", 1);

    let t1 = top.clone();
    let left = graph.computed("left", move || t1.read() + 1);
    let t2 = top.clone();
    let right = graph.computed("right", move || t2.read() * 2);
    let (l, r) = (left.clone(), right.clone());
    let bottom = graph.computed("bottom", move || l.read() + r.read());

    assert_eq!(bottom.read(), 4);
    top.write(10);
    assert_eq!(bottom.read(), 31);
    assert_eq!(bottom.recompute_count(), 2);
}

#[test]
#[should_panic(expected = "cycle detected")]
fn cycle_panics_on_read() {
    let graph = Graph::new();
    let late: Arc<OnceLock<Computed<i32>>> = Arc::new(OnceLock::new());

    let late_in_rule = late.clone();
    let a = graph.computed("a", move || {
        late_in_rule.get().map(|b| b.read()).unwrap_or(0) + 1
    });
    let a_in_rule = a.clone();
    let b = graph.computed("b", move || a_in_rule.read() + 1);
    let _ = late.set(b.clone());

    b.read();
}

#[test]
fn flipping_dependency_direction_is_not_a_cycle() {
    let graph = Graph::new();
    let cond = graph.stored("cond", true);
    let late: Arc<OnceLock<Computed<i32>>> = Arc::new(OnceLock::new());

    let (cond_c, late_in_rule) = (cond.clone(), late.clone());
    let c = graph.computed("c", move || {
        if cond_c.read() {
            late_in_rule.get().map(|d| d.read()).unwrap_or(-1)
        } else {
            0
        }
    });
    let (cond_d, c_in_rule) = (cond.clone(), c.clone());
    let d = graph.computed("d", move || if cond_d.read() { 1 } else { c_in_rule.read() + 1 });
    let _ = late.set(d.clone());

    assert_eq!(c.read(), 1);
    assert_eq!(c.dependencies(), vec![cond.id(), d.id()]);

    // d now reads c, and c's stale edge from d is still in place.
    cond.write(false);
    assert_eq!(d.read(), 1);
    assert_eq!(c.read(), 0);
    assert_eq!(d.dependencies(), vec![cond.id(), c.id()]);
    assert!(c.dependencies().iter().all(|id| *id != d.id()));
}

#[test]
fn self_read_is_a_cycle() {
    let graph = Graph::new();
    let late: Arc<OnceLock<Computed<i32>>> = Arc::new(OnceLock::new());

    let late_in_rule = late.clone();
    let node = graph.computed("self", move || match late_in_rule.get() {
        Some(me) => match me.try_read() {
            Err(GraphError::CycleDetected { path }) => path.len() as i32,
            _ => -1,
        },
        None => 0,
    });
    let _ = late.set(node.clone());

    assert_eq!(node.read(), 2);
}

#[test]
#[should_panic(expected = "evaluation depth")]
fn depth_limit_is_enforced() {
    let config = GraphConfig {
        max_depth: 3,
        ..GraphConfig::default()
    };
    let graph = Graph::with_config(config);
    let source = graph.stored("source", 0);

    let s = source.clone();
    let mut tip = graph.computed("link_0", move || s.read());
    for i in 1..6 {
        let prev = tip.clone();
        tip = graph.computed(&format!("link_{i}"), move || prev.read() + 1);
    }

    tip.read();
}

#[test]
fn removed_node_reports_release() {
    let graph = Graph::new();
    let a = graph.stored("a", 1);
    let a_in_rule = a.clone();
    let b = graph.computed("b", move || a_in_rule.try_read().unwrap_or(-1));

    assert_eq!(b.read(), 1);
    assert!(graph.remove(a.id()));

    assert_eq!(
        a.try_read(),
        Err(GraphError::NodeReleased { node: a.id() })
    );
    // The dependent lost its input and reruns.
    assert!(b.dependencies().is_empty());
    assert_eq!(b.read(), -1);
}

#[test]
fn dropping_handles_releases_nodes() {
    let graph = Graph::new();
    {
        let a = graph.stored("a", 1);
        let a_in_rule = a.clone();
        let b = graph.computed("b", move || a_in_rule.read());
        b.read();
        assert_eq!(graph.stats().nodes, 2);
    }
    assert_eq!(graph.stats().nodes, 0);
    assert_eq!(graph.stats().edges, 0);
}

// ----------------------------------------------------------------------------
// Registrations
// ----------------------------------------------------------------------------

/// Several writes before the callback runs produce a single callback.
#[test]
fn registration_coalesces_writes() {
    let graph = Graph::new();
    let a = graph.stored("a", 0);
    let reader = a.clone();
    let (runs, runs_in_body) = counter();

    let registration = graph.track(move |_| {
        reader.read();
        runs_in_body.fetch_add(1, Ordering::SeqCst);
    });

    for i in 1..=10 {
        a.write(i);
    }
    graph.flush();

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(registration.run_count(), 2);
}

/// Changes to different watched nodes in one episode are one callback,
/// reporting the first node that changed.
#[test]
fn registration_coalesces_across_nodes() {
    let graph = Graph::new();
    let a = graph.stored("a", 0);
    let b = graph.stored("b", 0);
    let (ra, rb) = (a.clone(), b.clone());
    let triggers = Arc::new(Mutex::new(Vec::new()));
    let triggers_in_body = triggers.clone();

    let _registration = graph.track(move |run| {
        ra.read();
        rb.read();
        triggers_in_body.lock().push(run.trigger);
    });

    b.write(1);
    a.write(1);
    b.write(2);
    assert_eq!(graph.flush(), 1);

    assert_eq!(*triggers.lock(), vec![None, Some(b.id())]);
}

/// A registration watching only a computed node hears about writes upstream.
#[test]
fn registration_fires_through_computed() {
    let graph = Graph::new();
    let a = graph.stored("a", 1);
    let a_in_rule = a.clone();
    let doubled = graph.computed("doubled", move || a_in_rule.read() * 2);

    let seen = Arc::new(AtomicI32::new(0));
    let seen_in_body = seen.clone();
    let d = doubled.clone();
    let registration = graph.track(move |_| {
        seen_in_body.store(d.read(), Ordering::SeqCst);
    });
    assert_eq!(registration.watched(), vec![doubled.id()]);
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    a.write(21);
    graph.flush();
    assert_eq!(seen.load(Ordering::SeqCst), 42);
}

/// The watched set is rebuilt on every run.
#[test]
fn registration_retracks_conditional_reads() {
    let graph = Graph::new();
    let cond = graph.stored("cond", true);
    let x = graph.stored("x", 0);
    let y = graph.stored("y", 0);
    let (c, xr, yr) = (cond.clone(), x.clone(), y.clone());

    let registration = graph.track(move |_| {
        if c.read() {
            xr.read();
        } else {
            yr.read();
        }
    });
    assert_eq!(registration.watched(), vec![cond.id(), x.id()]);

    y.write(1);
    assert_eq!(graph.flush(), 0);

    cond.write(false);
    graph.flush();
    assert_eq!(registration.watched(), vec![cond.id(), y.id()]);

    x.write(1);
    assert_eq!(graph.flush(), 0);
    y.write(2);
    assert_eq!(graph.flush(), 1);
    assert_eq!(registration.run_count(), 3);
}

#[test]
fn cancelled_registration_stays_quiet() {
    let graph = Graph::new();
    let a = graph.stored("a", 0);
    let reader = a.clone();
    let (runs, runs_in_body) = counter();

    let registration = graph.track(move |_| {
        reader.read();
        runs_in_body.fetch_add(1, Ordering::SeqCst);
    });
    registration.cancel();
    registration.cancel();

    a.write(1);
    graph.flush();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(registration.is_cancelled());
}

// ----------------------------------------------------------------------------
// Persistence and hooks
// ----------------------------------------------------------------------------

#[test]
fn persisted_node_round_trips_through_store() {
    let store = MemoryStore::new();
    let graph = Graph::new();

    let theme = graph
        .build_stored("theme")
        .backend(KeyedBackend::new(store.clone(), "settings.theme").with_codec(Codec::Json))
        .build(String::from("light"));
    assert_eq!(theme.read(), "light");
    assert!(!store.contains("settings.theme"));

    theme.write(String::from("dark"));
    assert_eq!(
        store.get("settings.theme").unwrap(),
        Some(br#""dark""#.to_vec())
    );

    let restored = graph
        .build_stored("theme")
        .backend(KeyedBackend::new(store, "settings.theme").with_codec(Codec::Json))
        .build(String::from("light"));
    assert_eq!(restored.read(), "dark");
}

#[test]
fn save_failures_do_not_block_propagation() {
    struct ReadOnly(Arc<AtomicUsize>);

    impl Backend<i32> for ReadOnly {
        fn load(&self) -> Result<Option<i32>, BackendError> {
            Ok(Some(7))
        }

        fn save(&self, _value: &i32) -> Result<(), BackendError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Store("read-only".into()))
        }
    }

    let graph = Graph::new();
    let saves = Arc::new(AtomicUsize::new(0));
    let a = graph.build_stored("a").backend(ReadOnly(saves.clone())).build(0);
    let a_in_rule = a.clone();
    let b = graph.computed("b", move || a_in_rule.read() + 1);

    assert_eq!(b.read(), 8);
    a.write(1);
    assert_eq!(b.read(), 2);
    assert_eq!(saves.load(Ordering::SeqCst), 1);
}

// ----------------------------------------------------------------------------
// Threads
// ----------------------------------------------------------------------------

#[test]
fn concurrent_writers_and_readers() {
    let graph = Graph::new();
    let inputs: Vec<_> = (0..4).map(|i| graph.stored(&format!("in_{i}"), 0)).collect();

    let in_rule = inputs.clone();
    let total = graph.computed("total", move || in_rule.iter().map(|n| n.read()).sum::<i32>());
    assert_eq!(total.read(), 0);

    let writers: Vec<_> = inputs
        .iter()
        .cloned()
        .map(|input| {
            thread::spawn(move || {
                for v in 1..=100 {
                    input.write(v);
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let total = total.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let value = total.read();
                    assert!((0..=400).contains(&value));
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    assert_eq!(total.read(), 400);
    assert_eq!(total.dependencies().len(), 4);
}

// ----------------------------------------------------------------------------
// Async
// ----------------------------------------------------------------------------

#[tokio::test]
async fn change_stream_ends_on_release() {
    let graph = Graph::new();
    let a = graph.stored("a", 0);
    let changes = a.changes();

    a.write(1);
    a.write(2);
    drop(a);

    let values: Vec<i32> = changes.collect().await;
    assert_eq!(values, vec![1, 2]);
    assert_eq!(graph.stats().nodes, 0);
}

#[tokio::test]
async fn computed_stream_emits_on_recompute_after_read() {
    let graph = Graph::new();
    let a = graph.stored("a", 1);
    let reader = a.clone();
    let doubled = graph.computed("doubled", move || reader.read() * 2);
    let changes = doubled.changes();

    assert_eq!(doubled.read(), 2);
    a.write(2);
    a.write(3);
    assert_eq!(doubled.read(), 6);
    a.write(4);
    assert_eq!(doubled.read(), 8);
    doubled.close_changes();

    let values: Vec<i32> = changes.collect().await;
    assert_eq!(values, vec![6, 8]);
}

#[tokio::test]
async fn closed_changes_keep_handlers() {
    let graph = Graph::new();
    let a = graph.stored("a", 0);
    let reader = a.clone();
    let plus_one = graph.computed("plus_one", move || reader.read() + 1);
    plus_one.read();

    let stored_seen = Arc::new(Mutex::new(Vec::new()));
    let computed_seen = Arc::new(Mutex::new(Vec::new()));
    let (s, c) = (stored_seen.clone(), computed_seen.clone());
    a.on_change(move |v| s.lock().push(*v));
    plus_one.on_change(move |v| c.lock().push(*v));

    let stored_changes = a.changes();
    let computed_changes = plus_one.changes();
    a.write(1);
    plus_one.read();
    a.close_changes();
    plus_one.close_changes();
    a.write(2);
    plus_one.read();

    assert_eq!(stored_changes.collect::<Vec<_>>().await, vec![1]);
    assert_eq!(computed_changes.collect::<Vec<_>>().await, vec![2]);
    assert_eq!(*stored_seen.lock(), vec![1, 2]);
    assert_eq!(*computed_seen.lock(), vec![2, 3]);

    let mut late = a.changes();
    assert_eq!(late.next().await, None);
}

#[tokio::test]
async fn observed_stream_coalesces_bursts() {
    let graph = Graph::new();
    let a = graph.stored("a", 1);
    let reader = a.clone();
    let mut observed = graph.observe(move || reader.read() * 10);

    assert_eq!(observed.next().await, Some(10));

    a.write(2);
    a.write(3);
    a.write(4);
    assert_eq!(observed.next().await, Some(40));
    assert_eq!(observed.registration().run_count(), 2);
}

#[tokio::test]
async fn registration_runs_on_tokio() {
    let graph = Graph::new();
    let a = graph.stored("a", 0);
    let reader = a.clone();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let _registration = graph.track(move |_| {
        let _ = tx.send(reader.read());
    });
    assert_eq!(rx.recv().await, Some(0));

    a.write(5);
    assert_eq!(rx.recv().await, Some(5));
}
