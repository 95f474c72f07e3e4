use std::cell::RefCell;
use std::io::Read;
use std::net::TcpStream;
use std::rc::Rc;
use std::time::Duration;

use evloop::{ConnectionWatcher, Protocol, Reactor, Transport};

const PAYLOAD: usize = 10 * 1024;

#[derive(Default)]
struct Observed {
    transport: Option<Transport>,
    pending_at_connect: bool,
    queued_at_connect: usize,
}

struct Pusher {
    observed: Rc<RefCell<Observed>>,
}

impl Protocol for Pusher {
    fn connected(&mut self, transport: Transport) {
        // The transport starts out not-writable, so the whole payload is
        // buffered and write interest is requested.
        transport.write(&vec![0x42u8; PAYLOAD]).unwrap();

        let mut observed = self.observed.borrow_mut();
        observed.pending_at_connect = transport.is_write_pending();
        observed.queued_at_connect = transport.queued_bytes();
        observed.transport = Some(transport);
    }

    fn received(&mut self, _data: &[u8]) {}
}

#[test]
fn buffered_write_flushes_on_the_writable_event() {
    let mut reactor = Reactor::new().unwrap();
    let observed = Rc::new(RefCell::new(Observed::default()));

    let mut listener = ConnectionWatcher::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let shared = observed.clone();
    listener.set_protocol_factory(move || {
        Box::new(Pusher {
            observed: shared.clone(),
        })
    });
    let addr = listener.local_addr().unwrap();
    reactor.register(listener).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();

    for _ in 0..100 {
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        let done = observed
            .borrow()
            .transport
            .as_ref()
            .is_some_and(|t| t.queued_bytes() == 0);
        if done {
            break;
        }
    }

    {
        let observed = observed.borrow();
        assert!(observed.pending_at_connect);
        assert_eq!(observed.queued_at_connect, PAYLOAD);

        let transport = observed.transport.as_ref().unwrap();
        assert_eq!(transport.queued_bytes(), 0);
        assert!(!transport.is_write_pending());
    }

    let mut total = 0;
    let mut buf = [0u8; 4096];
    while total < PAYLOAD {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) => panic!("client read failed early: {}", err),
        }
    }
    assert_eq!(total, PAYLOAD);
}
