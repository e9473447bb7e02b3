//! Completion pump.
//!
//! `pump()` is the only call in the engine that blocks. Each call
//! dispatches at most one callback:
//!
//! - a posted injector callback, if any is queued (run with `(0, 0)`);
//! - otherwise the next port completion: its context is taken out of the
//!   slab, fixed up, its leases released, its callback run once with
//!   `(error, bytes)`, and the context dropped.
//!
//! The internal wake read is consumed and re-armed here and never shows
//! up as a dispatch.

use crate::context::OperationContext;
use crate::engine::Engine;

use cport_core::entry::{Completion, PumpOutcome, Token};
use cport_core::error::{CportError, Result};
use cport_core::port::CompletionPort;
use cport_core::{ktrace, kwarn};

use std::time::{Duration, Instant};

impl<P: CompletionPort> Engine<P> {
    /// Wait up to `timeout` (`None` = forever) and dispatch one completion.
    ///
    /// Returns `Timeout` when nothing completed in time. Port failures
    /// other than timeout surface as `CportError::System`.
    pub fn pump(&mut self, timeout: Option<Duration>) -> Result<PumpOutcome> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(out) = self.run_injected() {
                return Ok(out);
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let Some(c) = self.port.wait(remaining)? else {
                self.stats.timeouts += 1;
                return Ok(PumpOutcome::Timeout);
            };
            if let Some(out) = self.complete(c)? {
                return Ok(out);
            }
        }
    }

    /// Finish one port completion. `None` for the internal wake read.
    pub(crate) fn complete(&mut self, c: Completion) -> Result<Option<PumpOutcome>> {
        let Some(mut ctx) = self.slab.take(c.token) else {
            kwarn!("completion for unknown token {} (result {})", c.token, c.result);
            return Err(CportError::UnknownToken(c.token));
        };
        let result = ctx.finish(c.result);
        let OperationContext { kind, fd, callback, pinned } = ctx;
        // Buffers become readable before the callback runs.
        drop(pinned);

        if self.wake_token == Some(c.token) {
            self.wake_token = None;
            drop(callback);
            self.rearm_wake(result);
            return Ok(None);
        }

        let (error, bytes) = Completion { token: c.token, result, flags: c.flags }.split();
        ktrace!("dispatch {} fd={} token={} error={} bytes={}", kind, fd, c.token, error, bytes);
        callback(error, bytes);
        self.stats.dispatched += 1;
        Ok(Some(PumpOutcome::Dispatched { token: c.token, error, bytes }))
    }

    fn rearm_wake(&mut self, result: i64) {
        if self.closing {
            return;
        }
        if result < 0 {
            // A broken eventfd would spin here; posted callbacks still run
            // on every pump, they just no longer wake a blocked one.
            kwarn!("injector wake read failed: errno {}; not re-armed", -result);
            return;
        }
        if let Err(e) = self.arm_wake() {
            kwarn!("injector wake read not re-armed: {}", e);
        }
    }

    /// Run one posted callback.
    pub(crate) fn run_injected(&mut self) -> Option<PumpOutcome> {
        let callback = self.injector.pop()?;
        let token = Token::internal(self.injected_seq);
        self.injected_seq += 1;
        callback(0, 0);
        self.stats.injected += 1;
        Some(PumpOutcome::Dispatched { token, error: 0, bytes: 0 })
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{Destination, Engine, EngineBuilder};
    use crate::inline_port::InlinePort;

    use cport_core::address::Address;
    use cport_core::entry::{PumpOutcome, Token};
    use cport_core::error::CportError;

    use std::net::{Ipv4Addr, TcpListener, UdpSocket};
    use std::os::fd::{AsRawFd, RawFd};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    const WAIT: Option<Duration> = Some(Duration::from_secs(5));

    fn engine() -> Engine<InlinePort> {
        EngineBuilder::new().build_with_port(InlinePort::new(64)).unwrap()
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    type Log = Arc<Mutex<Vec<(&'static str, i32, u32)>>>;

    fn record(log: &Log, tag: &'static str) -> impl FnOnce(i32, u32) + Send + 'static {
        let log = Arc::clone(log);
        move |e, n| log.lock().unwrap().push((tag, e, n))
    }

    /// Pump until `n` callbacks have landed in `log`.
    fn pump_until(engine: &mut Engine<InlinePort>, log: &Log, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().unwrap().len() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {} callbacks", n);
            engine.pump(Some(Duration::from_millis(100))).unwrap();
        }
    }

    #[test]
    fn write_then_read_through_pipe() {
        let (r, w) = pipe();
        let mut engine = engine();
        let out = engine.allocate_buffer(5);
        out.fill(b"hello").unwrap();
        let input = engine.allocate_buffer(16);
        let log: Log = Arc::default();

        let t = engine.write(w, &out, None, record(&log, "write")).unwrap();
        assert_eq!(engine.outstanding(), 1);
        let outcome = engine.pump(WAIT).unwrap();
        assert_eq!(outcome, PumpOutcome::Dispatched { token: t, error: 0, bytes: 5 });
        assert_eq!(engine.outstanding(), 0);

        engine.read(r, &input, None, record(&log, "read")).unwrap();
        pump_until(&mut engine, &log, 2);
        assert_eq!(log.lock().unwrap()[1], ("read", 0, 5));
        assert_eq!(&input.to_vec().unwrap()[..5], b"hello");

        drop(engine);
        close(r);
        close(w);
    }

    #[test]
    fn partial_length_write() {
        let (r, w) = pipe();
        let mut engine = engine();
        let out = engine.allocate_buffer(8);
        let log: Log = Arc::default();
        engine.write(w, &out, Some(3), record(&log, "w")).unwrap();
        pump_until(&mut engine, &log, 1);
        let (_, e, n) = log.lock().unwrap()[0];
        assert_eq!(e, 0);
        assert!(n <= 3);
        drop(engine);
        close(r);
        close(w);
    }

    #[test]
    fn inject_event_dispatched_by_next_pump() {
        let mut engine = engine();
        let log: Log = Arc::default();
        let t = engine.inject_event(record(&log, "inject")).unwrap();
        assert!(log.lock().unwrap().is_empty());
        let outcome = engine.pump(WAIT).unwrap();
        assert_eq!(outcome, PumpOutcome::Dispatched { token: t, error: 0, bytes: 0 });
        assert_eq!(log.lock().unwrap()[0], ("inject", 0, 0));
    }

    #[test]
    fn n_operations_n_pumps() {
        let mut engine = engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let baseline = engine.outstanding();
        let n = 10;
        for _ in 0..n {
            let h = Arc::clone(&hits);
            engine
                .inject_event(move |_, _| {
                    h.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(engine.outstanding(), baseline + n);
        for _ in 0..n {
            assert!(!engine.pump(WAIT).unwrap().is_timeout());
        }
        assert_eq!(hits.load(Ordering::SeqCst), n);
        assert_eq!(engine.outstanding(), baseline);
        assert_eq!(engine.stats().dispatched, n as u64);
    }

    #[test]
    fn idle_pump_times_out() {
        let mut engine = engine();
        let start = Instant::now();
        assert!(engine.pump(Some(Duration::from_millis(30))).unwrap().is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(engine.stats().timeouts, 1);
    }

    #[test]
    fn async_failure_still_releases_context() {
        let (r, w) = pipe();
        close(r);
        let mut engine = engine();
        let buf = engine.allocate_buffer(4);
        let log: Log = Arc::default();
        engine.write(w, &buf, None, record(&log, "w")).unwrap();
        pump_until(&mut engine, &log, 1);
        assert_eq!(log.lock().unwrap()[0], ("w", libc::EPIPE, 0));
        assert_eq!(engine.outstanding(), 0);
        assert!(!buf.is_lent());
        drop(engine);
        close(w);
    }

    #[test]
    fn udp_send_to_recv_from() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        let a_port = a.local_addr().unwrap().port();
        let b_port = b.local_addr().unwrap().port();

        let mut engine = engine();
        let rx = engine.allocate_buffer(64);
        let rx_addr = engine.allocate_address_buffer();
        let tx = engine.allocate_buffer(4);
        tx.fill(b"ping").unwrap();
        let log: Log = Arc::default();

        engine.recv_from(a.as_raw_fd(), &rx, &rx_addr, None, 0, record(&log, "recv")).unwrap();
        engine
            .send_to(b.as_raw_fd(), &tx, Destination::inet("127.0.0.1", a_port), None, 0, record(&log, "send"))
            .unwrap();
        pump_until(&mut engine, &log, 2);

        let got = log.lock().unwrap().clone();
        assert!(got.contains(&("send", 0, 4)));
        assert!(got.contains(&("recv", 0, 4)));
        assert_eq!(&rx.to_vec().unwrap()[..4], b"ping");
        assert_eq!(engine.decode_address(&rx_addr), Address::inet(Ipv4Addr::LOCALHOST, b_port));
    }

    #[test]
    fn tcp_accept_and_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        let client = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        assert!(accept_fd >= 0 && client >= 0);

        let mut engine = engine();
        let out = engine.allocate_accept_buffer();
        let log: Log = Arc::default();
        engine.accept(listener.as_raw_fd(), accept_fd, &out, record(&log, "accept")).unwrap();
        engine
            .connect(client, Destination::inet("127.0.0.1", port), record(&log, "connect"))
            .unwrap();
        pump_until(&mut engine, &log, 2);

        let got = log.lock().unwrap().clone();
        assert!(got.contains(&("accept", 0, 0)));
        assert!(got.contains(&("connect", 0, 0)));

        let (local, remote) = engine.accept_addresses(&out);
        assert_eq!(local, Address::inet(Ipv4Addr::LOCALHOST, port));
        match remote {
            Address::Inet(sa) => assert_eq!(*sa.ip(), Ipv4Addr::LOCALHOST),
            other => panic!("unexpected peer {:?}", other),
        }

        // The accepted connection now lives on accept_fd.
        let info = engine.socket_info(accept_fd).unwrap();
        assert_eq!(info.sock_type, libc::SOCK_STREAM);

        drop(engine);
        close(accept_fd);
        close(client);
    }

    #[test]
    fn injector_wakes_blocked_pump() {
        let mut engine = engine();
        let injector = engine.injector();
        let ran_on = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&ran_on);

        let poster = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            injector
                .post(move |e, n| {
                    *seen.lock().unwrap() = Some((std::thread::current().id(), e, n));
                })
                .unwrap();
        });

        let outcome = engine.pump(None).unwrap();
        poster.join().unwrap();
        match outcome {
            PumpOutcome::Dispatched { token, error: 0, bytes: 0 } => assert!(token.is_internal()),
            other => panic!("unexpected {:?}", other),
        }
        let (tid, e, n) = ran_on.lock().unwrap().take().unwrap();
        assert_eq!(tid, std::thread::current().id());
        assert_eq!((e, n), (0, 0));
        assert_eq!(engine.outstanding(), 0);
        assert_eq!(engine.stats().injected, 1);
    }

    #[test]
    fn wake_read_is_never_reported() {
        let mut engine = engine();
        let injector = engine.injector();
        injector.post(|_, _| {}).unwrap();
        injector.post(|_, _| {}).unwrap();
        assert!(!engine.pump(WAIT).unwrap().is_timeout());
        assert!(!engine.pump(WAIT).unwrap().is_timeout());
        // Only the wake read is left; it must not surface.
        assert!(engine.pump(Some(Duration::from_millis(20))).unwrap().is_timeout());
        assert_eq!(engine.stats().dispatched, 0);
        assert_eq!(engine.stats().injected, 2);
    }

    #[test]
    fn unknown_token_is_an_error() {
        let mut engine = engine();
        let stray = cport_core::entry::Completion { token: Token::new(42, 3), result: 0, flags: 0 };
        assert!(matches!(engine.complete(stray), Err(CportError::UnknownToken(_))));
    }

    #[test]
    fn shutdown_drains_then_reports_leaks() {
        let mut engine = engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        engine
            .inject_event(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(engine.shutdown(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let (r, w) = pipe();
        let mut engine = EngineBuilder::new()
            .drain_timeout(Duration::from_millis(20))
            .build_with_port(InlinePort::new(8))
            .unwrap();
        let buf = engine.allocate_buffer(8);
        engine.read(r, &buf, None, |_, _| panic!("never completes")).unwrap();
        assert_eq!(engine.shutdown(), 1);
        assert!(buf.is_lent());
        close(r);
        close(w);
    }

    #[test]
    fn post_after_shutdown_fails() {
        let engine = engine();
        let injector = engine.injector();
        assert_eq!(engine.shutdown(), 0);
        assert!(injector.post(|_, _| {}).is_err());
    }
}
