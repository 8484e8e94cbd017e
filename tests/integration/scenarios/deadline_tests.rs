//! Deadline scheduling against wall-clock windows

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use svharness::{TimerBackend, TimerWheel};

#[test]
fn reversed_issue_order_still_fires_in_time_order_within_windows() {
    let wheel = TimerWheel::new();
    let fired: Arc<Mutex<Vec<(u32, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    // Issue the 5s deadline first, the 2s deadline second.
    for (tag, secs) in [(5u32, 5u64), (2, 2)] {
        let fired = fired.clone();
        wheel.after(Duration::from_secs(secs), TimerBackend::Thread, move || {
            fired.lock().unwrap().push((tag, started.elapsed()));
        });
    }

    std::thread::sleep(Duration::from_secs(6));

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 2);
    let (first_tag, first_at) = fired[0];
    let (second_tag, second_at) = fired[1];

    assert_eq!(first_tag, 2, "the 2s deadline must fire first");
    assert_eq!(second_tag, 5);
    assert!(first_at < second_at);

    // Each callback lands within its ±1s window.
    assert!(
        first_at >= Duration::from_secs(1) && first_at <= Duration::from_secs(3),
        "2s deadline fired at {first_at:?}"
    );
    assert!(
        second_at >= Duration::from_secs(4) && second_at <= Duration::from_secs(6),
        "5s deadline fired at {second_at:?}"
    );
}

#[test]
fn cancelled_deadline_never_fires_while_siblings_do() {
    let wheel = TimerWheel::new();
    let fired: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let keep = {
        let fired = fired.clone();
        wheel.after(Duration::from_millis(200), TimerBackend::Thread, move || {
            fired.lock().unwrap().push(1);
        })
    };
    let drop_me = {
        let fired = fired.clone();
        wheel.after(Duration::from_millis(100), TimerBackend::Thread, move || {
            fired.lock().unwrap().push(2);
        })
    };

    wheel.cancel(&drop_me);
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(*fired.lock().unwrap(), vec![1]);
    assert!(keep.has_fired());
}
