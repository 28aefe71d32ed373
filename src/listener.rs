use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::task::{self, Task};

/// Token used for waking the listener's poll loop.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Token of the listening socket.
const LISTENER_TOKEN: Token = Token(0);

/// Receives every accepted connection along with its remote address.
pub(crate) type AcceptFn = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Accepts connections on one link's address until stopped. A failed bind is retried.
pub(crate) struct LinkListener {
    task: Task,
    waker: Arc<Waker>,
}

impl LinkListener {
    pub fn spawn(
        name: &str,
        addr: SocketAddr,
        retry: Duration,
        on_accept: AcceptFn,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let log_name = format!("listener {name}");
        let task = task::spawn(format!("tcpcl-listen-{name}"), move |cancel| {
            run(poll, addr, retry, cancel, on_accept, &log_name)
        })?;

        Ok(Self { task, waker })
    }

    /// Stops accepting and waits, bounded, for the listener thread.
    pub fn stop(self, join_timeout: Duration) {
        let Self { mut task, waker } = self;
        task.cancel();
        let _ = waker.wake();
        task.join(join_timeout);
    }
}

fn run(
    mut poll: Poll,
    addr: SocketAddr,
    retry: Duration,
    cancel: Receiver<()>,
    on_accept: AcceptFn,
    name: &str,
) {
    let listener = loop {
        match bind(addr) {
            Ok(listener) => break listener,
            Err(err) => {
                log::warn!("{name}: cannot bind {addr}: {err}, retrying in {retry:?}");
                if task::sleep_or_cancel(&cancel, retry) {
                    return;
                }
            }
        }
    };

    if let Err(err) = listen(&mut poll, &listener, &cancel, &on_accept, name) {
        log::error!("{name}: stopped on error: {err}");
    }

    log::info!("{name}: no longer listening at {addr}");
}

fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn listen(
    poll: &mut Poll,
    listener: &TcpListener,
    cancel: &Receiver<()>,
    on_accept: &AcceptFn,
    name: &str,
) -> io::Result<()> {
    // Readiness is tracked on a duplicate of the socket; accepting goes through the original so
    // that accepted connections come out as std streams.
    let mut source = mio::net::TcpListener::from_std(listener.try_clone()?);
    poll.registry()
        .register(&mut source, LISTENER_TOKEN, Interest::READABLE)?;

    log::info!("{name}: listening at {}", listener.local_addr()?);

    let mut events = Events::with_capacity(16);

    loop {
        if task::is_cancelled(cancel) {
            return Ok(());
        }

        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }

        let readable = events.iter().any(|event| event.token() == LISTENER_TOKEN);
        if !readable {
            continue;
        }

        loop {
            match listener.accept() {
                Ok((stream, remote)) => {
                    log::debug!("{name}: accepted connection from {remote}");
                    stream.set_nonblocking(false)?;
                    on_accept(stream, remote);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("{name}: accept failed: {err}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    #[test]
    fn accepts_until_stopped() {
        let _ = env_logger::builder().is_test(true).try_init();

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 7301));
        let (tx, rx) = crossbeam_channel::unbounded();

        let listener = LinkListener::spawn(
            "test",
            addr,
            Duration::from_millis(50),
            Arc::new(move |_stream, remote| {
                let _ = tx.send(remote);
            }),
        )
        .unwrap();

        let client = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        };

        let remote = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(remote, client.local_addr().unwrap());

        let started = Instant::now();
        listener.stop(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(2));

        std::thread::sleep(Duration::from_millis(50));
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn bind_is_retried() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 7302));
        let blocker = TcpListener::bind(addr).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let listener = LinkListener::spawn(
            "retry",
            addr,
            Duration::from_millis(20),
            Arc::new(move |_stream, remote| {
                let _ = tx.send(remote);
            }),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        drop(blocker);

        let _client = loop {
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        };

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        listener.stop(Duration::from_secs(2));
    }
}
