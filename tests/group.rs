use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gyre::{Error, EventLoopGroup, Executor, GroupConfig};

fn current_thread_name() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_string()
}

#[test]
fn tasks_round_robin_across_the_fleet() {
    let group = EventLoopGroup::new(2).expect("group");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut futures = Vec::new();
    for _ in 0..4 {
        let seen = seen.clone();
        futures.push(group.next().submit(move || {
            seen.lock().unwrap().push(current_thread_name());
        }));
    }
    for fut in futures {
        fut.sync().expect("task failed");
    }

    let seen = seen.lock().unwrap();
    let mut per_loop: HashMap<String, usize> = HashMap::new();
    for name in seen.iter() {
        *per_loop.entry(name.clone()).or_default() += 1;
    }
    assert_eq!(per_loop.len(), 2, "expected both loops to run tasks: {seen:?}");
    assert!(per_loop.values().all(|&n| n == 2), "uneven split: {per_loop:?}");

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .sync()
        .expect("shutdown");
}

#[test]
fn a_singleton_group_always_picks_the_sole_loop() {
    let group = EventLoopGroup::new(1).expect("group");
    let first = group.next().id();
    for _ in 0..16 {
        assert_eq!(group.next().id(), first);
    }
    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .sync()
        .expect("shutdown");
}

#[test]
fn tasks_from_one_thread_run_in_submission_order() {
    let group = EventLoopGroup::new(1).expect("group");
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    for i in 0..64 {
        let order = order.clone();
        let done = done_tx.clone();
        group
            .next()
            .execute(move || {
                order.lock().unwrap().push(i);
                if i == 63 {
                    done.send(()).unwrap();
                }
            })
            .expect("execute");
    }
    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("tasks never finished");
    assert_eq!(*order.lock().unwrap(), (0..64).collect::<Vec<_>>());

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .sync()
        .expect("shutdown");
}

#[test]
fn scheduled_tasks_honor_delay_and_ordering() {
    let group = EventLoopGroup::new(1).expect("group");
    let started = Instant::now();
    let fut = group
        .next()
        .schedule(move || started.elapsed(), Duration::from_millis(50));
    fut.sync().expect("scheduled task failed");
    let elapsed = fut.get_now().expect("no result");
    assert!(elapsed >= Duration::from_millis(45), "ran early: {elapsed:?}");

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .sync()
        .expect("shutdown");
}

#[test]
fn cancelling_a_scheduled_task_prevents_it_from_running() {
    let group = EventLoopGroup::new(1).expect("group");
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let fut = group.next().schedule(
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        Duration::from_millis(200),
    );
    assert!(fut.cancel(false));
    assert!(matches!(fut.sync(), Err(Error::Cancelled)));

    thread::sleep(Duration::from_millis(400));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .sync()
        .expect("shutdown");
}

#[test]
fn full_io_ratio_drains_the_whole_queue() {
    let group = EventLoopGroup::with_config(
        1,
        GroupConfig {
            io_ratio: Some(100),
            ..GroupConfig::default()
        },
    )
    .expect("group");

    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for i in 0..1000 {
        let counter = counter.clone();
        let tx = tx.clone();
        group
            .next()
            .execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                if i == 999 {
                    tx.send(()).unwrap();
                }
            })
            .expect("execute");
    }
    rx.recv_timeout(Duration::from_secs(5)).expect("queue never drained");
    assert_eq!(counter.load(Ordering::SeqCst), 1000);

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .sync()
        .expect("shutdown");
}

#[test]
fn shutdown_terminates_every_loop_and_refuses_new_work() {
    let group = EventLoopGroup::new(2).expect("group");
    group.next().execute(|| {}).expect("execute before shutdown");

    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(5))
        .sync()
        .expect("shutdown");
    assert!(group.is_terminated());

    let refused = group.next().execute(|| {});
    assert!(matches!(refused, Err(Error::IllegalState(_))));
}

#[test]
fn quiet_period_waits_for_stragglers() {
    let group = EventLoopGroup::new(1).expect("group");
    let ran = Arc::new(AtomicUsize::new(0));

    // Shut down with a generous quiet period, then race a task in; the
    // quiet period must let it run before termination.
    let fut = group.shutdown_gracefully(Duration::from_millis(200), Duration::from_secs(5));
    let r = ran.clone();
    if group
        .next()
        .execute(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .is_ok()
    {
        fut.sync().expect("shutdown");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    } else {
        // The loop already moved past accepting work; nothing to assert
        // beyond clean termination.
        fut.sync().expect("shutdown");
    }
    assert!(group.is_terminated());
}

#[test]
fn zero_sized_group_is_rejected() {
    assert!(matches!(
        EventLoopGroup::new(0),
        Err(Error::InvalidArgument(_))
    ));
}
