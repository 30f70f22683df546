//! Integration test: per-thread variable state machine and bulk teardown.
//!
//! Cases that inspect per-thread bookkeeping run on a fresh thread so it
//! starts empty.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fastlocal_core::{
    ThreadLocalVariable, global_registry, remove_all, slot_table::INITIAL_CAPACITY,
    thread, tracked_variable_count,
};

#[derive(Clone, Copy, Debug)]
enum Op {
    Get,
    Set(u32),
    Remove,
}

fn on_generic_thread<F: FnOnce() + Send + 'static>(f: F) {
    std::thread::spawn(f).join().unwrap();
}

fn on_fast_thread<F: FnOnce() + Send + 'static>(f: F) {
    thread::spawn(f).unwrap().join().unwrap();
}

fn both_modes(f: fn()) {
    on_generic_thread(f);
    on_fast_thread(f);
}

#[test]
fn get_set_remove_cycle() {
    both_modes(|| {
        let var = ThreadLocalVariable::with_initial(|| 0u32).unwrap();
        assert_eq!(var.get().unwrap(), 0);
        var.set(5).unwrap();
        assert_eq!(var.get().unwrap(), 5);
        var.remove();
        assert_eq!(var.get().unwrap(), 0);
        assert_eq!(tracked_variable_count(), 1);
    });
}

#[test]
fn is_set_follows_last_operation() {
    both_modes(|| {
        let var = ThreadLocalVariable::with_initial(|| 1u32).unwrap();
        assert!(!var.is_set());

        let script = [
            Op::Remove,
            Op::Get,
            Op::Get,
            Op::Remove,
            Op::Set(9),
            Op::Remove,
            Op::Remove,
            Op::Set(3),
            Op::Set(4),
            Op::Get,
            Op::Remove,
        ];
        for op in script {
            match op {
                Op::Get => {
                    var.get().unwrap();
                }
                Op::Set(v) => var.set(v).unwrap(),
                Op::Remove => var.remove(),
            }
            let expect = !matches!(op, Op::Remove);
            assert_eq!(var.is_set(), expect, "after {op:?}");
            assert_eq!(tracked_variable_count(), usize::from(expect), "after {op:?}");
        }
    });
}

#[test]
fn stored_none_is_distinct_from_unset() {
    on_generic_thread(|| {
        let var = ThreadLocalVariable::with_initial(|| Some(1u8)).unwrap();
        var.set(None).unwrap();
        assert!(var.is_set());
        assert_eq!(var.get().unwrap(), None);
    });
}

#[test]
fn remove_all_clears_only_touched_variables() {
    both_modes(|| {
        let touched: Vec<_> = (0..5)
            .map(|i| ThreadLocalVariable::with_initial(move || i * 10).unwrap())
            .collect();
        let untouched = ThreadLocalVariable::with_initial(|| 77u32).unwrap();

        for (i, var) in touched.iter().enumerate() {
            if i % 2 == 0 {
                var.set(1000 + i as u32).unwrap();
            } else {
                var.get().unwrap();
            }
        }
        assert_eq!(tracked_variable_count(), 5);
        assert!(!untouched.is_set());

        remove_all();

        assert_eq!(tracked_variable_count(), 0);
        assert!(touched.iter().all(|v| !v.is_set()));
        assert!(!untouched.is_set());
        assert_eq!(untouched.get().unwrap(), 77);
        assert_eq!(touched[2].get().unwrap(), 20);
    });
}

#[test]
fn remove_all_runs_hooks_once_per_set_variable() {
    let hooks = Arc::new(AtomicUsize::new(0));
    let vars: Vec<_> = (0..6)
        .map(|_| {
            let h = Arc::clone(&hooks);
            ThreadLocalVariable::builder(|| 0u8)
                .on_removal(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap()
        })
        .collect();

    let v = vars.clone();
    on_generic_thread(move || {
        for var in &v[..4] {
            var.set(1).unwrap();
        }
        // Removed before the bulk pass: must not be cleared twice.
        v[0].remove();
        remove_all();
        remove_all();
    });
    assert_eq!(hooks.load(Ordering::SeqCst), 4);
}

#[test]
fn removal_set_stays_bounded() {
    on_generic_thread(|| {
        let vars: Vec<_> = (0..8)
            .map(|_| ThreadLocalVariable::<u64>::new().unwrap())
            .collect();
        for round in 0..1_000u64 {
            for (i, var) in vars.iter().enumerate() {
                var.set(round).unwrap();
                if (i as u64 + round) % 3 == 0 {
                    var.remove();
                }
            }
            let live = vars.iter().filter(|v| v.is_set()).count();
            assert_eq!(tracked_variable_count(), live);
        }
    });
}

#[test]
fn values_survive_table_growth() {
    both_modes(|| {
        let vars: Vec<_> = (0..=40)
            .map(|_| ThreadLocalVariable::<usize>::new().unwrap())
            .collect();
        for (i, var) in vars.iter().enumerate() {
            var.set(i * 3).unwrap();
        }
        let highest = vars.last().unwrap().slot().get();
        assert!(highest >= INITIAL_CAPACITY);
        for (i, var) in vars.iter().enumerate() {
            assert_eq!(var.get().unwrap(), i * 3);
        }
        assert_eq!(tracked_variable_count(), 41);
    });
}

#[test]
fn slots_are_strictly_increasing_in_construction_order() {
    let vars: Vec<_> = (0..10_000)
        .map(|_| ThreadLocalVariable::<u8>::new().unwrap())
        .collect();
    for pair in vars.windows(2) {
        assert!(pair[1].slot() > pair[0].slot());
    }
    let last = global_registry().last_allocated().unwrap();
    assert!(last >= vars.last().unwrap().slot());
}

#[test]
fn variable_handles_are_shareable_across_threads() {
    let var = Arc::new(ThreadLocalVariable::with_initial(|| String::from("init")).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let var = Arc::clone(&var);
            std::thread::spawn(move || {
                var.set(format!("t{i}")).unwrap();
                var.get().unwrap()
            })
        })
        .collect();
    let seen: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(seen, ["t0", "t1", "t2", "t3"]);
    assert!(!var.is_set());
}
