use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use horizon_io::{CycleHandle, EventLoop, NetConfig, Removable, Timer};

#[test]
fn remote_calls_run_once_in_issue_order() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    lp.start_keep_alive();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let remote = lp.remote();
    let calls = Arc::clone(&seen);
    let sender = thread::spawn(move || {
        for i in 0..10 {
            let calls = Arc::clone(&calls);
            remote.execute_on_loop_thread(move |_| calls.lock().unwrap().push(i));
        }
        remote.execute_on_loop_thread(|lp| lp.stop_keep_alive());
    });
    lp.run()?;
    sender.join().unwrap();
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn cycle_callback_runs_until_stopped() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let count = Rc::new(Cell::new(0));
    let handle: Rc<Cell<Option<CycleHandle>>> = Rc::new(Cell::new(None));
    let (c, h) = (Rc::clone(&count), Rc::clone(&handle));
    let id = lp.schedule_call_on_each_loop_cycle(move |lp| {
        c.set(c.get() + 1);
        if c.get() == 5 {
            if let Some(id) = h.get() {
                lp.stop_call_on_each_loop_cycle(id);
            }
        }
    });
    handle.set(Some(id));
    lp.run()?;
    assert_eq!(count.get(), 5);
    Ok(())
}

#[test]
fn background_work_completes_on_loop_thread() -> anyhow::Result<()> {
    let lp = EventLoop::with_config(NetConfig { worker_threads: 2, ..NetConfig::default() })?;
    let loop_thread = thread::current().id();
    let results = Rc::new(RefCell::new(Vec::new()));
    let ran = Arc::new(AtomicUsize::new(0));
    for i in 0..8u64 {
        let ran = Arc::clone(&ran);
        let results = Rc::clone(&results);
        lp.add_work(
            move || {
                ran.fetch_add(1, Ordering::SeqCst);
                (thread::current().id(), i * i)
            },
            move |_, (worker, square)| {
                assert_eq!(thread::current().id(), loop_thread);
                assert_ne!(worker, loop_thread);
                results.borrow_mut().push(square);
            },
        );
    }
    lp.run()?;
    assert_eq!(ran.load(Ordering::SeqCst), 8);
    let mut squares = results.borrow().clone();
    squares.sort_unstable();
    assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    Ok(())
}

#[test]
fn panicking_work_does_not_stall_the_loop() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let done = Rc::new(Cell::new(false));
    let d = Rc::clone(&done);
    lp.add_work(|| -> u32 { panic!("worker failure") }, move |_, _| d.set(true));
    lp.run()?;
    assert!(!done.get());
    Ok(())
}

#[test]
fn timer_fires_after_timeout_and_can_repeat() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let started = Instant::now();
    let once = Timer::new(&lp);
    let fired_at = Rc::new(Cell::new(None));
    let f = Rc::clone(&fired_at);
    once.start(Duration::from_millis(30), move |_| f.set(Some(Instant::now())));

    let ticks = Rc::new(Cell::new(0));
    let repeating = Timer::new(&lp);
    let t = Rc::clone(&ticks);
    repeating.start_repeating(Duration::from_millis(5), Duration::from_millis(5), move |timer| {
        t.set(t.get() + 1);
        if t.get() == 3 {
            timer.stop();
        }
    });

    lp.run()?;
    let fired_at = fired_at.get().expect("one-shot timer fired");
    assert!(fired_at.duration_since(started) >= Duration::from_millis(30));
    assert_eq!(ticks.get(), 3);
    Ok(())
}

#[test]
fn removed_timer_never_fires() -> anyhow::Result<()> {
    let lp = EventLoop::new()?;
    let timer = Timer::new(&lp);
    let fired = Rc::new(Cell::new(false));
    let f = Rc::clone(&fired);
    timer.start(Duration::from_millis(5), move |_| f.set(true));
    let removed = Rc::new(Cell::new(false));
    let r = Rc::clone(&removed);
    timer.set_on_schedule_removal(move || r.set(true));
    timer.schedule_removal();
    assert!(timer.is_removal_scheduled());
    lp.run()?;
    assert!(!fired.get());
    assert!(removed.get());
    Ok(())
}
