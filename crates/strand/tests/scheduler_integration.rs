//! Integration tests for the scheduler: exactly-once execution, dynamic
//! resizing around blocking tasks, overflow, idle termination and
//! shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use strand::{Scheduler, SchedulerConfig, TaskMode};

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_external_burst_executes_every_task_once() {
    let scheduler = Scheduler::new(2, 8).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..50 {
        let counter = counter.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::SeqCst) == 50
    }));
    // No duplicates and nothing left pending.
    assert_eq!(counter.load(Ordering::SeqCst), 50);
    assert!(wait_until(Duration::from_secs(5), || {
        let snapshot = scheduler.snapshot();
        snapshot.global_queue_size == 0 && snapshot.local_queue_sizes.is_empty()
    }));
    assert!(scheduler.created_workers() <= 8);
    scheduler.shutdown();
}

#[test]
fn test_exactly_once_under_concurrent_dispatchers() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;

    let scheduler = Arc::new(Scheduler::new(2, 16).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    let dispatchers: Vec<_> = (0..THREADS)
        .map(|t| {
            let scheduler = scheduler.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let counter = counter.clone();
                    let mode = if (t + i) % 2 == 0 {
                        TaskMode::NonBlocking
                    } else {
                        TaskMode::ProbablyBlocking
                    };
                    scheduler.dispatch(mode, move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        })
        .collect();
    for d in dispatchers {
        d.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(30), || {
        counter.load(Ordering::SeqCst) == THREADS * PER_THREAD
    }));
    assert_eq!(counter.load(Ordering::SeqCst), THREADS * PER_THREAD);
    scheduler.shutdown();
}

#[test]
fn test_blocking_task_releases_permit_for_cpu_work() {
    let scheduler = Arc::new(Scheduler::new(2, 8).unwrap());

    let blocking_started = Arc::new(AtomicBool::new(false));
    let (release_blocker, blocker_gate) = mpsc::channel::<()>();
    let spinner_started = Arc::new(AtomicBool::new(false));
    let release_spinner = Arc::new(AtomicBool::new(false));

    // A running non-blocking task dispatches a probably-blocking task.
    {
        let scheduler = scheduler.clone();
        let blocking_started = blocking_started.clone();
        scheduler.clone().dispatch(TaskMode::NonBlocking, move || {
            scheduler.dispatch(TaskMode::ProbablyBlocking, move || {
                blocking_started.store(true, Ordering::SeqCst);
                let _ = blocker_gate.recv();
            });
        });
    }

    // Independent CPU-bound work must keep flowing meanwhile.
    {
        let spinner_started = spinner_started.clone();
        let release_spinner = release_spinner.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            spinner_started.store(true, Ordering::SeqCst);
            while !release_spinner.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        });
    }

    assert!(wait_until(Duration::from_secs(10), || {
        blocking_started.load(Ordering::SeqCst) && spinner_started.load(Ordering::SeqCst)
    }));

    // One worker is blocking with its permit released while another holds
    // a permit and executes CPU work.
    assert!(wait_until(Duration::from_secs(10), || {
        let snapshot = scheduler.snapshot();
        snapshot.blocking_workers >= 1 && snapshot.cpu_workers >= 1
    }));
    let snapshot = scheduler.snapshot();
    assert!(snapshot.counted_blocking_workers >= 1);
    assert!(snapshot.created_workers >= 2);

    release_spinner.store(true, Ordering::SeqCst);
    release_blocker.send(()).unwrap();
    scheduler.shutdown();
}

#[test]
fn test_worker_burst_overflows_to_global_queue() {
    let scheduler = Arc::new(Scheduler::new(2, 4).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    // Dispatch 200 tasks in one tight burst from inside a worker so they
    // all target the same local queue and overflow past the threshold.
    {
        let scheduler = scheduler.clone();
        let counter = counter.clone();
        scheduler.clone().dispatch(TaskMode::NonBlocking, move || {
            for _ in 0..200 {
                let counter = counter.clone();
                scheduler.dispatch(TaskMode::NonBlocking, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
    }

    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::SeqCst) == 200
    }));
    assert_eq!(counter.load(Ordering::SeqCst), 200);
    assert!(wait_until(Duration::from_secs(5), || {
        scheduler.snapshot().global_queue_size == 0
    }));
    scheduler.shutdown();
}

#[test]
fn test_cpu_acquired_workers_never_exceed_core_size() {
    let scheduler = Arc::new(Scheduler::new(2, 8).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    let sampler_done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let scheduler = scheduler.clone();
        let sampler_done = sampler_done.clone();
        thread::spawn(move || {
            let mut violations = 0;
            while !sampler_done.load(Ordering::SeqCst) {
                let snapshot = scheduler.snapshot();
                if snapshot.cpu_workers > snapshot.core_pool_size {
                    violations += 1;
                }
                assert!(snapshot.created_workers >= 1);
                assert!(snapshot.created_workers <= snapshot.max_pool_size);
                assert!(snapshot.counted_blocking_workers <= snapshot.created_workers);
            }
            violations
        })
    };

    for i in 0..2_000 {
        let counter = counter.clone();
        let mode = if i % 4 == 0 {
            TaskMode::ProbablyBlocking
        } else {
            TaskMode::NonBlocking
        };
        scheduler.dispatch(mode, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_until(Duration::from_secs(30), || {
        counter.load(Ordering::SeqCst) == 2_000
    }));
    sampler_done.store(true, Ordering::SeqCst);
    assert_eq!(sampler.join().unwrap(), 0);
    scheduler.shutdown();
}

#[test]
fn test_surplus_workers_terminate_after_keep_alive() {
    let scheduler = Arc::new(
        Scheduler::with_config(SchedulerConfig {
            name: "keep-alive-test".to_string(),
            core_pool_size: 1,
            max_pool_size: 4,
            keep_alive: Duration::from_millis(50),
            ..SchedulerConfig::default()
        })
        .unwrap(),
    );

    // Blocking tasks force the pool above its core size.
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let counter = counter.clone();
        scheduler.dispatch(TaskMode::ProbablyBlocking, move || {
            thread::sleep(Duration::from_millis(100));
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::SeqCst) == 3
    }));
    assert!(scheduler.created_workers() >= 2);

    // With no work arriving, the pool shrinks back to its core size.
    assert!(wait_until(Duration::from_secs(20), || {
        scheduler.created_workers() == 1
    }));
    let snapshot = scheduler.snapshot();
    assert!(snapshot.terminated_workers >= 1);
    scheduler.shutdown();
}

#[test]
fn test_shutdown_wakes_parked_workers() {
    let scheduler = Scheduler::new(4, 8).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let counter = counter.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::SeqCst) == 10
    }));

    // Let the workers run out of work and park.
    wait_until(Duration::from_secs(5), || {
        scheduler.snapshot().parked_workers >= 1
    });

    scheduler.shutdown();
    assert!(scheduler.is_terminated());

    // Nothing runs after shutdown is acknowledged.
    let late = Arc::new(AtomicUsize::new(0));
    let c = late.clone();
    scheduler.dispatch(TaskMode::NonBlocking, move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(late.load(Ordering::SeqCst), 0);
}

#[test]
fn test_fair_dispatch_executes() {
    let scheduler = Arc::new(Scheduler::new(2, 4).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    // Fair dispatch from both an external thread and a worker thread.
    {
        let counter = counter.clone();
        scheduler.dispatch_fair(TaskMode::NonBlocking, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let scheduler = scheduler.clone();
        let counter = counter.clone();
        scheduler.clone().dispatch(TaskMode::NonBlocking, move || {
            for _ in 0..10 {
                let counter = counter.clone();
                scheduler.dispatch_fair(TaskMode::NonBlocking, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
    }

    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::SeqCst) == 11
    }));
    scheduler.shutdown();
}

#[test]
fn test_park_unpark_churn_loses_no_tasks() {
    let scheduler = Scheduler::new(2, 4).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    // Alternate bursts and idle gaps so workers repeatedly park and get
    // pulled back out of the parked stack.
    let mut expected = 0;
    for round in 0..10 {
        for _ in 0..20 {
            let counter = counter.clone();
            scheduler.dispatch(TaskMode::NonBlocking, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        expected += 20;
        assert!(
            wait_until(Duration::from_secs(10), || {
                counter.load(Ordering::SeqCst) == expected
            }),
            "round {round} lost tasks",
        );
        thread::sleep(Duration::from_millis(20));
    }
    scheduler.shutdown();
}

#[test]
fn test_permitless_worker_drains_blocking_backlog() {
    // One permit. A gated blocking task occupies the first worker (the
    // pool creates a second for CPU work), a spinner then holds the
    // permit hostage, and a blocking backlog piles up. Once the gate
    // opens, the first worker must drain the backlog without ever
    // re-acquiring a permit.
    let scheduler = Scheduler::new(1, 4).unwrap();

    let blocker_started = Arc::new(AtomicBool::new(false));
    let (open_gate, gate) = mpsc::channel::<()>();
    {
        let blocker_started = blocker_started.clone();
        scheduler.dispatch(TaskMode::ProbablyBlocking, move || {
            blocker_started.store(true, Ordering::SeqCst);
            let _ = gate.recv();
        });
    }
    assert!(wait_until(Duration::from_secs(10), || {
        blocker_started.load(Ordering::SeqCst)
    }));

    let spinner_started = Arc::new(AtomicBool::new(false));
    let release_spinner = Arc::new(AtomicBool::new(false));
    {
        let spinner_started = spinner_started.clone();
        let release_spinner = release_spinner.clone();
        scheduler.dispatch(TaskMode::NonBlocking, move || {
            spinner_started.store(true, Ordering::SeqCst);
            while !release_spinner.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        });
    }
    assert!(wait_until(Duration::from_secs(10), || {
        spinner_started.load(Ordering::SeqCst)
    }));

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let counter = counter.clone();
        scheduler.dispatch(TaskMode::ProbablyBlocking, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    open_gate.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::SeqCst) == 4
    }));
    release_spinner.store(true, Ordering::SeqCst);
    scheduler.shutdown();
}
