use std::cell::RefCell;
use std::io::Write;
use std::mem;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use evloop::{ConnectionWatcher, Protocol, Reactor, Transport};

#[derive(Default)]
struct State {
    received: Vec<u8>,
    disconnects: Vec<bool>,
    transport: Option<Transport>,
    close_on_receive: bool,
}

struct Tracker {
    state: Rc<RefCell<State>>,
}

impl Protocol for Tracker {
    fn connected(&mut self, transport: Transport) {
        self.state.borrow_mut().transport = Some(transport);
    }

    fn received(&mut self, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        state.received.extend_from_slice(data);
        if state.close_on_receive {
            if let Some(transport) = &state.transport {
                transport.close();
            }
        }
    }

    fn disconnected(&mut self, error: Option<std::io::Error>) {
        self.state.borrow_mut().disconnects.push(error.is_some());
    }
}

fn serve(state: Rc<RefCell<State>>) -> (Reactor, std::net::SocketAddr) {
    let mut reactor = Reactor::new().unwrap();
    let mut listener = ConnectionWatcher::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.set_protocol_factory(move || {
        Box::new(Tracker {
            state: state.clone(),
        })
    });
    let addr = listener.local_addr().unwrap();
    reactor.register(listener).unwrap();
    (reactor, addr)
}

fn reset_on_drop(client: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            client.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(ret, 0, "setsockopt(SO_LINGER) failed");
}

#[test]
fn peer_reset_mid_read_disconnects_exactly_once() {
    let state = Rc::new(RefCell::new(State::default()));
    let (mut reactor, addr) = serve(state.clone());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"boom").unwrap();
    thread::sleep(Duration::from_millis(50));
    reset_on_drop(&client);
    drop(client);

    for _ in 0..100 {
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        if !state.borrow().disconnects.is_empty() {
            break;
        }
    }

    assert_eq!(state.borrow().disconnects.len(), 1);
    // The handle is out of the registry; only the listener remains and
    // further cycles report nothing for it.
    assert_eq!(reactor.watcher_count(), 1);
    for _ in 0..5 {
        reactor.turn(Some(Duration::from_millis(10))).unwrap();
    }
    assert_eq!(state.borrow().disconnects.len(), 1);
}

#[test]
fn clean_close_delivers_data_then_disconnected_none() {
    let state = Rc::new(RefCell::new(State::default()));
    let (mut reactor, addr) = serve(state.clone());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"tail").unwrap();
    client.shutdown(std::net::Shutdown::Write).unwrap();
    thread::sleep(Duration::from_millis(50));

    for _ in 0..100 {
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        if !state.borrow().disconnects.is_empty() {
            break;
        }
    }

    let state = state.borrow();
    // Bytes captured before the close are not lost.
    assert_eq!(state.received, b"tail");
    assert_eq!(state.disconnects.as_slice(), [false]);
}

#[test]
fn close_requested_in_a_callback_lands_on_the_next_cycle() {
    let state = Rc::new(RefCell::new(State {
        close_on_receive: true,
        ..State::default()
    }));
    let (mut reactor, addr) = serve(state.clone());

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"bye").unwrap();
    thread::sleep(Duration::from_millis(50));

    for _ in 0..100 {
        reactor.turn(Some(Duration::from_millis(20))).unwrap();
        if !state.borrow().received.is_empty() {
            break;
        }
    }
    // The close was requested inside `received`; delivery is deferred to the
    // next cycle, never the current one.
    assert!(state.borrow().disconnects.is_empty());

    reactor.turn(Some(Duration::from_millis(20))).unwrap();
    assert_eq!(state.borrow().disconnects.as_slice(), [false]);
    assert_eq!(reactor.watcher_count(), 1);
}
