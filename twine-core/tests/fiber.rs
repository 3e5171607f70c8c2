//! Integration tests for the fiber runtime.
//!
//! Each test bootstraps a cord on its own thread via `cord::run_main`,
//! so the suite exercises the same scheduler path production cords use:
//! a main fiber, the event loop around it, teardown afterwards.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};
use twine_core::error::CoreError;
use twine_core::{cond::FiberCond, cord, fiber, Fiber, FiberAttr, Trigger};

fn spawn_logger(log: &Rc<RefCell<String>>, tag: &'static str) -> Rc<Fiber> {
    let log = log.clone();
    Fiber::new(
        tag,
        Box::new(move || {
            log.borrow_mut().push_str(tag);
            Ok(())
        }),
    )
    .unwrap()
}

#[test]
fn fifo_wakeup_order() {
    cord::run_main("fifo", || {
        let log = Rc::new(RefCell::new(String::new()));
        let a = spawn_logger(&log, "A");
        let b = spawn_logger(&log, "B");
        let c = spawn_logger(&log, "C");
        fiber::wakeup(&a);
        fiber::wakeup(&b);
        fiber::wakeup(&c);
        // All three were woken in the same loop turn; they must run in
        // that order.
        fiber::sleep(Duration::ZERO);
        assert_eq!(*log.borrow(), "ABC");
        Ok(())
    })
    .unwrap();
}

#[test]
fn double_wakeup_is_idempotent() {
    cord::run_main("dwake", || {
        let log = Rc::new(RefCell::new(String::new()));
        let a = spawn_logger(&log, "A");
        fiber::wakeup(&a);
        fiber::wakeup(&a);
        fiber::sleep(Duration::ZERO);
        assert_eq!(*log.borrow(), "A");
        Ok(())
    })
    .unwrap();
}

#[test]
fn start_transfers_immediately() {
    cord::run_main("start", || {
        let log = Rc::new(RefCell::new(String::new()));
        let a = spawn_logger(&log, "A");
        fiber::start(&a);
        // `start` context-switches into the callee at once; by the time
        // it returns here the callee already ran to its first yield (or,
        // as here, to completion).
        assert_eq!(*log.borrow(), "A");
        Ok(())
    })
    .unwrap();
}

#[test]
fn join_returns_body_result_once() {
    cord::run_main("join", || {
        let f = Fiber::new(
            "ret",
            Box::new(|| Err(CoreError::IllegalParams("expected failure".into()))),
        )?;
        f.set_joinable(true);
        fiber::start(&f);
        let err = fiber::join(&f).unwrap_err();
        assert!(matches!(err, CoreError::IllegalParams(_)));
        // The fiber is recycled now; a second join must be rejected.
        assert!(matches!(fiber::join(&f), Err(CoreError::Unjoinable)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn join_waits_for_sleeping_fiber() {
    cord::run_main("join-wait", || {
        let f = Fiber::new(
            "sleeper",
            Box::new(|| {
                fiber::sleep(Duration::from_millis(20));
                Ok(())
            }),
        )?;
        f.set_joinable(true);
        fiber::start(&f);
        assert!(!f.is_dead());
        fiber::join(&f)?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn panic_is_caught_at_the_trampoline() {
    cord::run_main("panic", || {
        let f = Fiber::new("boom", Box::new(|| panic!("deliberate")))?;
        f.set_joinable(true);
        fiber::start(&f);
        let err = fiber::join(&f).unwrap_err();
        match err {
            CoreError::FiberPanic(msg) => assert!(msg.contains("deliberate")),
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn cancellation_is_cooperative() {
    cord::run_main("cancel", || {
        let f = Fiber::new(
            "victim",
            Box::new(|| loop {
                fiber::sleep(Duration::from_millis(5));
                fiber::testcancel()?;
            }),
        )?;
        f.set_joinable(true);
        fiber::start(&f);

        let begin = Instant::now();
        fiber::cancel(&f);
        let err = fiber::join(&f).unwrap_err();
        assert!(err.is_cancelled());
        // Observed within O(sleep delay) of the request.
        assert!(begin.elapsed() < Duration::from_secs(1));
        Ok(())
    })
    .unwrap();
}

#[test]
fn non_cancellable_fiber_is_not_woken_by_cancel() {
    cord::run_main("nocancel", || {
        let woke_early = Rc::new(Cell::new(false));
        let flag = woke_early.clone();
        let f = Fiber::new(
            "shielded",
            Box::new(move || {
                let prev = fiber::set_cancellable(false);
                assert!(prev);
                // Nothing wakes us before the timer: cancel must not.
                let timed_out = fiber::yield_timeout(Duration::from_millis(30));
                flag.set(!timed_out);
                fiber::set_cancellable(true);
                fiber::testcancel()?;
                Ok(())
            }),
        )?;
        f.set_joinable(true);
        fiber::start(&f);
        fiber::cancel(&f);
        let err = fiber::join(&f).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!woke_early.get());
        Ok(())
    })
    .unwrap();
}

#[test]
fn yield_timeout_reports_wakeup_source() {
    cord::run_main("yt", || {
        let timed_out = Rc::new(Cell::new(None));
        let out = timed_out.clone();
        let f = Fiber::new(
            "waiter",
            Box::new(move || {
                out.set(Some(fiber::yield_timeout(Duration::from_secs(5))));
                Ok(())
            }),
        )?;
        f.set_joinable(true);
        fiber::start(&f);
        fiber::wakeup(&f);
        fiber::join(&f)?;
        assert_eq!(timed_out.get(), Some(false));

        let timed_out = Rc::new(Cell::new(None));
        let out = timed_out.clone();
        let f = Fiber::new(
            "expirer",
            Box::new(move || {
                out.set(Some(fiber::yield_timeout(Duration::from_millis(5))));
                Ok(())
            }),
        )?;
        f.set_joinable(true);
        fiber::start(&f);
        fiber::join(&f)?;
        assert_eq!(timed_out.get(), Some(true));
        Ok(())
    })
    .unwrap();
}

#[test]
fn reschedule_round_robins() {
    cord::run_main("rr", || {
        let log = Rc::new(RefCell::new(String::new()));
        let mut handles = Vec::new();
        for tag in ["A", "B"] {
            let log = log.clone();
            let f = Fiber::new(
                tag,
                Box::new(move || {
                    for _ in 0..3 {
                        log.borrow_mut().push_str(tag);
                        fiber::reschedule();
                    }
                    Ok(())
                }),
            )?;
            f.set_joinable(true);
            fiber::wakeup(&f);
            handles.push(f);
        }
        for f in &handles {
            fiber::join(f)?;
        }
        assert_eq!(*log.borrow(), "ABABAB");
        Ok(())
    })
    .unwrap();
}

#[test]
fn fids_are_never_reused() {
    cord::run_main("fids", || {
        let f1 = Fiber::new("one", Box::new(|| Ok(())))?;
        let fid1 = f1.fid();
        assert!(fiber::find(fid1).is_some());
        fiber::start(&f1);
        // f1 is dead and recycled; its fid is gone from the registry.
        assert!(fiber::find(fid1).is_none());

        let f2 = Fiber::new("two", Box::new(|| Ok(())))?;
        assert!(f2.fid() > fid1);
        fiber::start(&f2);
        Ok(())
    })
    .unwrap();
}

#[test]
fn recycled_fiber_reuses_the_stack() {
    cord::run_main("pool", || {
        let stats_before = cord::current().stack_arena().stats().mapped.get();
        for i in 0..4 {
            let f = Fiber::new(&format!("worker-{i}"), Box::new(|| Ok(())))?;
            fiber::start(&f);
        }
        // One mapping serves all four bodies thanks to the dead pool.
        let stats_after = cord::current().stack_arena().stats().mapped.get();
        assert_eq!(stats_after, stats_before + 1);
        Ok(())
    })
    .unwrap();
}

#[inline(never)]
fn burn_stack(depth: usize) -> u64 {
    let mut frame = [0u8; 4096];
    frame[0] = depth as u8;
    let keep = std::hint::black_box(&mut frame);
    if depth == 0 {
        u64::from(keep[0])
    } else {
        burn_stack(depth - 1) + u64::from(keep[4095])
    }
}

#[test]
fn shallow_fiber_keeps_watermark_intact() {
    cord::run_main("wm-intact", || {
        let f = Fiber::new("shallow", Box::new(|| Ok(())))?;
        fiber::start(&f);
        let current = cord::current();
        let stats = current.stack_arena().stats();
        assert_eq!(stats.recycle_dontneed.get(), 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn deep_fiber_triggers_stack_release() {
    cord::run_main("wm-deep", || {
        // ~120 KiB of frames, well past the 64 KiB watermark window but
        // far from the 512 KiB stack end.
        let f = Fiber::new(
            "deep",
            Box::new(|| {
                std::hint::black_box(burn_stack(30));
                Ok(())
            }),
        )?;
        fiber::start(&f);
        let current = cord::current();
        let stats = current.stack_arena().stats();
        assert_eq!(stats.recycle_dontneed.get(), 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn custom_stack_fiber_is_not_pooled() {
    cord::run_main("custom", || {
        let mut attr = FiberAttr::new();
        attr.set_stack_size(64 * 1024)?;
        let before = cord::current().stack_arena().stats().mapped.get();
        let f = Fiber::new_with_attr("big", &attr, Box::new(|| Ok(())))?;
        f.set_joinable(true);
        fiber::start(&f);
        fiber::join(&f)?;
        // Let the scheduler drain the graveyard.
        fiber::sleep(Duration::ZERO);
        let after = cord::current().stack_arena().stats().mapped.get();
        assert_eq!(after, before);
        Ok(())
    })
    .unwrap();
}

#[test]
fn undersized_custom_stack_is_rejected() {
    let mut attr = FiberAttr::new();
    assert!(attr.set_stack_size(1024).is_err());
}

#[test]
fn on_stop_trigger_fires_on_death() {
    cord::run_main("onstop", || {
        let fired = Rc::new(Cell::new(false));
        let f = Fiber::new("observed", Box::new(|| Ok(())))?;
        let flag = fired.clone();
        let t = Trigger::new(move |_: &()| {
            flag.set(true);
            Ok(())
        });
        f.on_stop.add(&t);
        fiber::start(&f);
        assert!(fired.get());
        Ok(())
    })
    .unwrap();
}

#[test]
fn fiber_local_storage_roundtrip() {
    cord::run_main("storage", || {
        #[derive(Debug, PartialEq)]
        struct SessionTag(u32);

        fiber::local_set(SessionTag(7));
        assert_eq!(fiber::local_with(|t: &mut SessionTag| t.0), Some(7));
        assert_eq!(fiber::local_take::<SessionTag>(), Some(SessionTag(7)));
        assert_eq!(fiber::local_take::<SessionTag>(), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn cond_signal_wakes_in_arrival_order() {
    cord::run_main("cond", || {
        let cond = Rc::new(FiberCond::new());
        let log = Rc::new(RefCell::new(String::new()));
        let mut handles = Vec::new();
        for tag in ["A", "B"] {
            let cond = cond.clone();
            let log = log.clone();
            let f = Fiber::new(
                tag,
                Box::new(move || {
                    cond.wait();
                    log.borrow_mut().push_str(tag);
                    Ok(())
                }),
            )?;
            f.set_joinable(true);
            fiber::start(&f);
            handles.push(f);
        }
        cond.signal();
        fiber::sleep(Duration::ZERO);
        assert_eq!(*log.borrow(), "A");
        cond.broadcast();
        for f in &handles {
            fiber::join(f)?;
        }
        assert_eq!(*log.borrow(), "AB");
        Ok(())
    })
    .unwrap();
}

#[test]
fn cond_wait_timeout_expires() {
    cord::run_main("cond-to", || {
        let cond = FiberCond::new();
        let err = cond.wait_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_timeout());
        Ok(())
    })
    .unwrap();
}

#[test]
fn sleep_zero_lets_ready_fibers_run() {
    cord::run_main("sleep0", || {
        let log = Rc::new(RefCell::new(String::new()));
        let a = spawn_logger(&log, "A");
        fiber::wakeup(&a);
        let begin = Instant::now();
        fiber::sleep(Duration::ZERO);
        assert_eq!(*log.borrow(), "A");
        assert!(begin.elapsed() < Duration::from_millis(500));
        Ok(())
    })
    .unwrap();
}

#[test]
fn clock_is_monotonic() {
    cord::run_main("clock", || {
        let t1 = fiber::clock();
        fiber::sleep(Duration::from_millis(5));
        let t2 = fiber::clock();
        assert!(t2 > t1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn stat_walks_alive_fibers() {
    cord::run_main("stat", || {
        let f = Fiber::new(
            "parked",
            Box::new(|| {
                fiber::sleep(Duration::from_millis(50));
                Ok(())
            }),
        )?;
        f.set_joinable(true);
        fiber::start(&f);
        let mut names = Vec::new();
        fiber::stat(|f| {
            names.push(f.name());
            0
        });
        assert!(names.contains(&"main".to_string()));
        assert!(names.contains(&"parked".to_string()));
        fiber::join(&f)?;
        Ok(())
    })
    .unwrap();
}
