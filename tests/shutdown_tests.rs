use fiberjobs::{JobDescr, Scheduler, SchedulerConfig, SchedulerError, StackClass};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn small() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_fiber_workers(2)
        .with_io_workers(1)
        .with_pool(StackClass::Normal, 16, 64 * 1024)
        .with_pool(StackClass::Large, 1, 128 * 1024)
        .with_pool(StackClass::Gigantic, 1, 128 * 1024)
        .with_pool(StackClass::ExternalLibrary, 1, 128 * 1024)
}

#[test]
fn test_shutdown_during_job_execution() {
    let scheduler = Scheduler::new(small()).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let finished = finished.clone();
        scheduler
            .kick(JobDescr::new(move || {
                std::thread::sleep(Duration::from_millis(10));
                finished.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }

    // Shutdown waits for every kicked job.
    scheduler.shutdown().expect("Shutdown should succeed after jobs complete");
    assert_eq!(finished.load(Ordering::SeqCst), 10);
}

#[test]
fn test_shutdown_times_out_on_parked_fiber() {
    let config = small().with_shutdown_timeout_ms(50);
    let scheduler = Scheduler::new(config).unwrap();
    let handle = scheduler.handle();

    // A counter nobody will ever drain.
    let never = scheduler.generate_counter().unwrap();
    let blocker = never.clone();
    let parked = Arc::new(AtomicBool::new(false));
    let parked_clone = parked.clone();
    scheduler
        .kick(JobDescr::new(move || {
            blocker.increment();
            parked_clone.store(true, Ordering::SeqCst);
            handle.wait(&blocker);
        }))
        .unwrap();
    while !parked.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }

    let err = scheduler.shutdown().unwrap_err();
    assert!(matches!(err, SchedulerError::ShutdownTimedOut { in_flight: 1 }));
}

#[test]
fn test_drop_without_shutdown_joins_workers() {
    let ran = Arc::new(AtomicBool::new(false));
    {
        let scheduler = Scheduler::new(small()).unwrap();
        let ran = ran.clone();
        scheduler
            .kick(JobDescr::new(move || ran.store(true, Ordering::SeqCst)))
            .unwrap();
    }
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_every_stack_class_runs() {
    let scheduler = Scheduler::new(small()).unwrap();
    let counter = scheduler.generate_counter().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    for class in StackClass::ALL {
        let ran = ran.clone();
        scheduler
            .kick(
                JobDescr::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .with_stack_class(class)
                .with_counter(&counter),
            )
            .unwrap();
    }
    scheduler.wait(&counter);
    assert_eq!(ran.load(Ordering::SeqCst), StackClass::COUNT);
    scheduler.destroy_counter(counter);
    scheduler.shutdown().unwrap();
}
