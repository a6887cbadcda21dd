use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use hz_arbiter::timer::TimerService;
use hz_arbiter::touch::{TouchEvent, TouchState, TouchStateMachine};
use hz_arbiter::types::Pid;
use hz_arbiter::video::{EventInfo, VideoRateVoteAggregator};
use hz_arbiter::{ArbiterConfig, FrameRateArbiter, FrameRateRange, RefreshRateMode};

const THREADS: u64 = 4;
const VOTES_PER_THREAD: u64 = 200;

#[test]
fn concurrent_voters_see_cancel_before_enable() {
    let log: Arc<Mutex<Vec<(Pid, EventInfo)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_log = log.clone();
    let video = Arc::new(VideoRateVoteAggregator::new(Arc::new(
        move |pid: Pid, info: EventInfo| {
            sink_log.lock().unwrap().push((pid, info));
        },
    )));
    let start = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let video = video.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                for i in 0..VOTES_PER_THREAD {
                    // Two surfaces per thread; every fourth vote withdraws.
                    let surface = t * 2 + i % 2;
                    let rate = if i % 4 == 3 { 0 } else { 30 * (1 + (i * 7 + t) % 4) as u32 };
                    video.vote(surface, 1000 + t as Pid, rate);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let log = log.lock().unwrap();
    assert!(!log.is_empty());

    let mut active: i64 = 0;
    for (pid, info) in log.iter() {
        active += if info.enabled { 1 } else { -1 };
        assert!(
            (0..=1).contains(&active),
            "two votes active at once after notification to pid {}",
            pid
        );
    }

    match video.active_vote() {
        Some(vote) => {
            let (pid, info) = log.last().unwrap();
            assert!(info.enabled);
            assert_eq!(*pid, vote.pid);
            assert_eq!((info.min, info.max), (vote.rate, vote.rate));
            assert_eq!(active, 1);
        }
        None => assert_eq!(active, 0),
    }
}

#[test]
fn concurrent_touch_traffic_keeps_one_timer_per_screen() {
    let timers = TimerService::spawn("touch-stress").unwrap();
    let idles = Arc::new(AtomicUsize::new(0));
    let counter = idles.clone();
    let machine = TouchStateMachine::new(
        timers,
        Duration::from_millis(2),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let start = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let machine = machine.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                for i in 0..VOTES_PER_THREAD {
                    let event = if (i + t) % 2 == 0 { TouchEvent::Down } else { TouchEvent::Up };
                    machine.handle_event(0, event).unwrap();
                    assert!(machine.live_timer_count(0) <= 1);
                    if i % 16 == 0 {
                        thread::sleep(Duration::from_millis(3));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Whatever the interleaving, a lifted finger always times out.
    thread::sleep(Duration::from_millis(100));
    let state = machine.state(0);
    assert!(matches!(state, TouchState::Down | TouchState::Idle), "{}", state);
    assert_eq!(machine.live_timer_count(0), 0);

    let before = idles.load(Ordering::SeqCst);
    machine.handle_event(0, TouchEvent::Down).unwrap();
    machine.handle_event(0, TouchEvent::Up).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(machine.state(0), TouchState::Idle);
    assert_eq!(idles.load(Ordering::SeqCst), before + 1);
}

#[test]
fn touch_and_frames_from_many_threads_settle_after_idle() {
    let config = ArbiterConfig {
        up_timeout: Duration::from_millis(30),
        idle_timeout: Duration::from_millis(5),
        rs_idle_cnt: 1,
        ..ArbiterConfig::default()
    };
    let arbiter = FrameRateArbiter::new(config, Arc::new(|_: Pid, _: EventInfo| {}), None).unwrap();
    arbiter.add_screen(0, &[30, 60, 90, 120], 1).unwrap();
    arbiter.set_refresh_rate_mode(RefreshRateMode::High).unwrap();

    let toucher = {
        let arbiter = arbiter.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                arbiter.handle_touch(0, TouchEvent::Down).unwrap();
                arbiter.handle_touch(0, TouchEvent::Up).unwrap();
            }
        })
    };
    let compositor = {
        let arbiter = arbiter.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                arbiter.on_frame(FrameRateRange::default());
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    toucher.join().unwrap();
    compositor.join().unwrap();

    thread::sleep(Duration::from_millis(200));
    assert_eq!(arbiter.touch_machine().state(0), TouchState::Idle);
    assert_eq!(arbiter.touch_machine().live_timer_count(0), 0);
    assert_eq!(arbiter.registry().current_refresh_rate(0), Some(60));
}
