use std::cell::RefCell;
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use evloop::{ConnectionWatcher, Protocol, Reactor, ReactorBuilder, StopHandle, Transport};

struct Stopper {
    stop: StopHandle,
    connected: Rc<RefCell<usize>>,
}

impl Protocol for Stopper {
    fn connected(&mut self, _transport: Transport) {
        *self.connected.borrow_mut() += 1;
        self.stop.stop();
    }

    fn received(&mut self, _data: &[u8]) {}
}

#[test]
fn stop_handle_ends_start_from_a_callback() {
    let mut reactor = ReactorBuilder::new()
        .watchdog(Duration::from_millis(50))
        .build()
        .unwrap();
    let connected = Rc::new(RefCell::new(0usize));

    let mut listener = ConnectionWatcher::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let stop = reactor.stop_handle();
    let shared = connected.clone();
    listener.set_protocol_factory(move || {
        Box::new(Stopper {
            stop: stop.clone(),
            connected: shared.clone(),
        })
    });
    let addr = listener.local_addr().unwrap();
    reactor.register(listener).unwrap();

    let _client = TcpStream::connect(addr).unwrap();
    reactor.start().unwrap();

    assert_eq!(*connected.borrow(), 1);
}

#[test]
fn timers_fire_after_their_deadline() {
    let mut reactor = Reactor::new().unwrap();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let begin = Instant::now();

    let early = fired.clone();
    reactor.add_timer(Duration::from_millis(20), move || {
        early.borrow_mut().push("early");
    });
    let late = fired.clone();
    reactor.add_timer(Duration::from_millis(60), move || {
        late.borrow_mut().push("late");
    });

    for _ in 0..100 {
        reactor.turn(None).unwrap();
        if fired.borrow().len() == 2 {
            break;
        }
    }

    assert_eq!(fired.borrow().as_slice(), ["early", "late"]);
    assert!(begin.elapsed() >= Duration::from_millis(60));
}

#[test]
fn idle_turns_are_bounded_by_the_watchdog() {
    let mut reactor = ReactorBuilder::new()
        .watchdog(Duration::from_millis(30))
        .build()
        .unwrap();

    // No watchers, no timers: the cycle still returns within the cap.
    let begin = Instant::now();
    reactor.turn(None).unwrap();
    let elapsed = begin.elapsed();

    assert!(elapsed >= Duration::from_millis(25));
    assert!(elapsed < Duration::from_millis(500));
}
