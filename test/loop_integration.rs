//! Event Loop Integration Tests
//!
//! Runs real iterations over pipes, timers and signals and checks dispatch
//! order and registry bookkeeping.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use hostrt::os;
use hostrt::{HandlerResult, Runtime, RuntimeError, SignalAction};

/// Order log shared by callbacks
fn log() -> Rc<RefCell<Vec<&'static str>>> {
    Rc::new(RefCell::new(Vec::new()))
}

fn push(log: &Rc<RefCell<Vec<&'static str>>>, entry: &'static str) {
    log.borrow_mut().push(entry);
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_timers_fire_by_deadline_then_fifo() {
    let mut rt = Runtime::new();
    let order = log();

    for (delay, name) in [(20, "c"), (0, "a1"), (5, "b"), (0, "a2"), (0, "a3")] {
        let order = order.clone();
        rt.set_timeout(Duration::from_millis(delay), move |_rt| {
            push(&order, name);
            Ok(())
        });
    }

    rt.run().unwrap();
    assert_eq!(*order.borrow(), vec!["a1", "a2", "a3", "b", "c"]);
}

#[test]
fn test_timer_not_early() {
    let mut rt = Runtime::new();
    let start = Instant::now();
    let fired_at = Rc::new(Cell::new(None));
    let slot = fired_at.clone();
    rt.set_timeout(Duration::from_millis(30), move |_rt| {
        slot.set(Some(Instant::now()));
        Ok(())
    });

    rt.run().unwrap();
    let fired_at = fired_at.get().unwrap();
    assert!(fired_at.duration_since(start) >= Duration::from_millis(30));
}

#[test]
fn test_run_once_honours_cap() {
    let mut rt = Runtime::new();
    let id = rt.set_timeout(Duration::from_secs(60), |_rt| Ok(()));

    let start = Instant::now();
    assert!(rt.run_once(Some(Duration::from_millis(10))).unwrap());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(rt.stats().pending_timers, 1);

    assert!(rt.clear_timeout(id));
    assert!(!rt.run_once(None).unwrap());
}

// ============================================================================
// Descriptor handlers
// ============================================================================

#[test]
fn test_read_handlers_before_write_handlers() {
    let mut rt = Runtime::new();
    let order = log();
    let (r, w) = os::pipe().unwrap();
    os::write(w, b"ping").unwrap();

    let o = order.clone();
    rt.set_write_handler(
        w,
        Some(Box::new(move |rt: &mut Runtime| -> HandlerResult {
            push(&o, "write");
            rt.set_write_handler(w, None)?;
            Ok(())
        })),
    )
    .unwrap();
    let o = order.clone();
    rt.set_read_handler(
        r,
        Some(Box::new(move |rt: &mut Runtime| -> HandlerResult {
            let mut buf = [0u8; 16];
            let n = os::read(r, &mut buf)?;
            assert_eq!(&buf[..n], b"ping");
            push(&o, "read");
            rt.set_read_handler(r, None)?;
            Ok(())
        })),
    )
    .unwrap();

    rt.run().unwrap();
    assert_eq!(*order.borrow(), vec!["read", "write"]);
    os::close(r).unwrap();
    os::close(w).unwrap();
}

#[test]
fn test_handler_cleared_earlier_in_iteration_never_runs() {
    let mut rt = Runtime::new();
    let (r1, w1) = os::pipe().unwrap();
    let (r2, w2) = os::pipe().unwrap();
    os::write(w1, b"1").unwrap();
    os::write(w2, b"2").unwrap();

    let second_ran = Rc::new(Cell::new(false));
    rt.set_read_handler(
        r1,
        Some(Box::new(move |rt: &mut Runtime| -> HandlerResult {
            rt.set_read_handler(r1, None)?;
            rt.set_read_handler(r2, None)?;
            Ok(())
        })),
    )
    .unwrap();
    let flag = second_ran.clone();
    rt.set_read_handler(
        r2,
        Some(Box::new(move |_rt: &mut Runtime| -> HandlerResult {
            flag.set(true);
            Ok(())
        })),
    )
    .unwrap();

    rt.run().unwrap();
    assert!(!second_ran.get());
    for fd in [r1, w1, r2, w2] {
        os::close(fd).unwrap();
    }
}

#[test]
fn test_set_replaces_previous_handler() {
    let mut rt = Runtime::new();
    let order = log();
    let (r, w) = os::pipe().unwrap();
    os::write(w, b"x").unwrap();

    let o = order.clone();
    rt.set_read_handler(
        r,
        Some(Box::new(move |_rt: &mut Runtime| -> HandlerResult {
            push(&o, "first");
            Ok(())
        })),
    )
    .unwrap();
    let o = order.clone();
    rt.set_read_handler(
        r,
        Some(Box::new(move |rt: &mut Runtime| -> HandlerResult {
            push(&o, "second");
            rt.set_read_handler(r, None)?;
            Ok(())
        })),
    )
    .unwrap();
    assert_eq!(rt.stats().registered_fds, 1);

    rt.run().unwrap();
    assert_eq!(*order.borrow(), vec!["second"]);
    os::close(r).unwrap();
    os::close(w).unwrap();
}

#[test]
fn test_handler_cleared_before_run_never_runs() {
    let mut rt = Runtime::new();
    let (r, w) = os::pipe().unwrap();
    os::write(w, b"x").unwrap();

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    rt.set_read_handler(
        r,
        Some(Box::new(move |_rt: &mut Runtime| -> HandlerResult {
            flag.set(true);
            Ok(())
        })),
    )
    .unwrap();
    rt.set_read_handler(r, None).unwrap();
    assert_eq!(rt.stats().registered_fds, 0);

    let fired = Rc::new(Cell::new(false));
    let timer = fired.clone();
    rt.set_timeout(Duration::ZERO, move |_rt| {
        timer.set(true);
        Ok(())
    });

    rt.run().unwrap();
    assert!(fired.get());
    assert!(!ran.get());
    os::close(r).unwrap();
    os::close(w).unwrap();
}

#[test]
fn test_close_after_register_runs_nothing() {
    let mut rt = Runtime::new();
    let (r, w) = os::pipe().unwrap();
    os::write(w, b"x").unwrap();

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    rt.set_read_handler(
        r,
        Some(Box::new(move |_rt: &mut Runtime| -> HandlerResult {
            flag.set(true);
            Ok(())
        })),
    )
    .unwrap();
    rt.close(r).unwrap();
    rt.set_timeout(Duration::ZERO, |_rt| Ok(()));

    assert!(!rt.run_once(None).unwrap());
    assert!(!ran.get());
    assert_eq!(rt.stats().registered_fds, 0);
    os::close(w).unwrap();
}

#[test]
fn test_descriptor_closed_behind_runtime_is_dropped() {
    let mut rt = Runtime::new();
    let (r, w) = os::pipe().unwrap();
    // A high number the allocator will not hand out to a parallel test
    let fd = os::dup2(r, 901).unwrap();

    let ran = Rc::new(Cell::new(false));
    let flag = ran.clone();
    rt.set_read_handler(
        fd,
        Some(Box::new(move |_rt: &mut Runtime| -> HandlerResult {
            flag.set(true);
            Ok(())
        })),
    )
    .unwrap();
    os::close(fd).unwrap();

    rt.run_once(Some(Duration::from_millis(100))).unwrap();
    assert!(!ran.get());
    assert_eq!(rt.stats().registered_fds, 0);
    os::close(r).unwrap();
    os::close(w).unwrap();
}

#[test]
fn test_register_invalid_descriptor() {
    let mut rt = Runtime::new();
    let err = rt
        .set_read_handler(-5, Some(Box::new(|_rt: &mut Runtime| Ok(()))))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidDescriptor(-5)));
    assert!(!rt.has_pending_work());
}

#[test]
fn test_failing_handler_does_not_stop_loop() {
    let mut rt = Runtime::new();
    let (r, w) = os::pipe().unwrap();
    os::write(w, b"x").unwrap();

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    rt.set_read_handler(
        r,
        Some(Box::new(move |rt: &mut Runtime| -> HandlerResult {
            count.set(count.get() + 1);
            if count.get() == 1 {
                anyhow::bail!("first call fails");
            }
            let mut buf = [0u8; 4];
            os::read(r, &mut buf)?;
            rt.set_read_handler(r, None)?;
            Ok(())
        })),
    )
    .unwrap();

    rt.run().unwrap();
    assert_eq!(calls.get(), 2);
    assert_eq!(rt.stats().handler_failures, 1);
    os::close(r).unwrap();
    os::close(w).unwrap();
}

// ============================================================================
// Signals
// ============================================================================

#[test]
fn test_sigint_handler_runs_from_loop() {
    let mut rt = Runtime::new();
    let hits = Rc::new(Cell::new(0));
    let count = hits.clone();
    rt.bind_signal(
        libc::SIGINT,
        SignalAction::Handle(Box::new(move |rt: &mut Runtime| -> HandlerResult {
            count.set(count.get() + 1);
            rt.bind_signal(libc::SIGINT, SignalAction::Default)?;
            Ok(())
        })),
    )
    .unwrap();

    // The trap only records the signal
    assert_eq!(unsafe { libc::raise(libc::SIGINT) }, 0);
    assert_eq!(hits.get(), 0);

    assert!(!rt.run_once(None).unwrap());
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_bind_invalid_signal() {
    let mut rt = Runtime::new();
    let err = rt.bind_signal(0, SignalAction::Ignore).unwrap_err();
    assert!(matches!(err, RuntimeError::Os(e) if e == hostrt::Errno::EINVAL));
}
