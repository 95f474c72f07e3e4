use std::cell::RefCell;
use std::io::Write;
use std::net::TcpStream;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use evloop::{ConnectionWatcher, Protocol, Reactor};

/// Records every `received` delivery as a separate chunk, so the tests can
/// distinguish one concatenated delivery from several partial ones.
struct Chunks {
    deliveries: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Protocol for Chunks {
    fn received(&mut self, data: &[u8]) {
        self.deliveries.borrow_mut().push(data.to_vec());
    }
}

fn serve(deliveries: Rc<RefCell<Vec<Vec<u8>>>>) -> (Reactor, std::net::SocketAddr) {
    let mut reactor = Reactor::new().unwrap();
    let mut listener = ConnectionWatcher::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.set_protocol_factory(move || {
        Box::new(Chunks {
            deliveries: deliveries.clone(),
        })
    });
    let addr = listener.local_addr().unwrap();
    reactor.register(listener).unwrap();
    (reactor, addr)
}

#[test]
fn partial_reads_are_concatenated_into_one_delivery() {
    let deliveries = Rc::new(RefCell::new(Vec::new()));
    let (mut reactor, addr) = serve(deliveries.clone());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"PIN").unwrap();
    client.write_all(b"G\n").unwrap();
    // Let both segments land in the receive buffer before the loop drains.
    thread::sleep(Duration::from_millis(50));

    for _ in 0..100 {
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        if !deliveries.borrow().is_empty() {
            break;
        }
    }

    let got = deliveries.borrow();
    assert_eq!(got.len(), 1, "expected a single concatenated delivery");
    assert_eq!(got[0], b"PING\n");
}

#[test]
fn buffer_is_cleared_between_deliveries() {
    let deliveries = Rc::new(RefCell::new(Vec::new()));
    let (mut reactor, addr) = serve(deliveries.clone());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"first").unwrap();
    thread::sleep(Duration::from_millis(50));
    for _ in 0..100 {
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        if deliveries.borrow().len() == 1 {
            break;
        }
    }

    client.write_all(b"second").unwrap();
    thread::sleep(Duration::from_millis(50));
    for _ in 0..100 {
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        if deliveries.borrow().len() == 2 {
            break;
        }
    }

    let got = deliveries.borrow();
    assert_eq!(got.len(), 2);
    // No residue from the first delivery leaks into the second.
    assert_eq!(got[0], b"first");
    assert_eq!(got[1], b"second");
}
