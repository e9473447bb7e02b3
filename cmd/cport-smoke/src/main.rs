//! cport End-to-End Smoke Test
//!
//! Drives every operation kind through a real engine:
//!   Part A. Engine init: resolver, injector, socket query
//!   Part B. File I/O: write + read through a pipe
//!   Part C. Datagrams: send_to + recv_from, address decode
//!   Part D. Streams: accept onto a pre-created handle + connect
//!   Part E. Dispatch: inject_event, cross-thread injector, timeout
//!   Part F. Submit-time errors
//!   Part G. Shutdown
//!
//! Run: ./target/release/cport-smoke [--inline]
//! (`--inline` or CPORT_BACKEND=inline uses the poll(2) port)

use cport_core::address::Address;
use cport_core::entry::PumpOutcome;
use cport_core::env::env_get_str;
use cport_core::error::CportError;
use cport_core::port::CompletionPort;

use cport_module::{Destination, Engine, EngineBuilder};

use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

type Log = Arc<Mutex<Vec<(&'static str, i32, u32)>>>;

fn record(log: &Log, tag: &'static str) -> impl FnOnce(i32, u32) + Send + 'static {
    let log = Arc::clone(log);
    move |e, n| {
        if let Ok(mut l) = log.lock() {
            l.push((tag, e, n));
        }
    }
}

fn logged(log: &Log) -> Vec<(&'static str, i32, u32)> {
    log.lock().map(|l| l.clone()).unwrap_or_default()
}

/// Pump until `n` callbacks landed or 2s passed.
fn pump_until<P: CompletionPort>(engine: &mut Engine<P>, log: &Log, n: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while logged(log).len() < n {
        if Instant::now() >= deadline {
            return false;
        }
        if let Err(e) = engine.pump(Some(Duration::from_millis(100))) {
            println!("       pump error: {}", e);
            return false;
        }
    }
    true
}

fn pipe() -> Option<(RawFd, RawFd)> {
    let mut fds = [0; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    (rc == 0).then_some((fds[0], fds[1]))
}

fn close(fd: RawFd) {
    unsafe { libc::close(fd); }
}

// ════════════════════════════════════════════════════════════
// Part A: Engine init
// ════════════════════════════════════════════════════════════

fn test_init<P: CompletionPort>(t: &mut TestRunner, engine: &Engine<P>) {
    t.section(&format!("Part A: Engine init ({})", engine.port().name()));

    t.check("extensions resolved", engine.extensions().is_some(), "not resolved");
    t.check("outstanding == 0", engine.outstanding() == 0, &engine.outstanding().to_string());

    match UdpSocket::bind("127.0.0.1:0") {
        Ok(s) => match engine.socket_info(s.as_raw_fd()) {
            Ok(info) => t.check(
                "socket_info(udp)",
                info.family == libc::AF_INET && info.sock_type == libc::SOCK_DGRAM,
                &format!("{:?}", info),
            ),
            Err(e) => t.fail("socket_info(udp)", &e.to_string()),
        },
        Err(e) => t.fail("bind udp", &e.to_string()),
    }
}

// ════════════════════════════════════════════════════════════
// Part B: File I/O
// ════════════════════════════════════════════════════════════

fn test_file_io<P: CompletionPort>(t: &mut TestRunner, engine: &mut Engine<P>) {
    t.section("Part B: File I/O (pipe)");

    let Some((r, w)) = pipe() else {
        t.fail("pipe2", "failed");
        return;
    };
    let log: Log = Arc::default();
    let out = engine.allocate_buffer(13);
    out.fill(b"hello, cport!");
    let input = engine.allocate_buffer(64);

    let ok = engine.write(w, &out, None, record(&log, "write")).is_ok();
    t.check("write submitted", ok, "submit failed");
    let ok = engine.read(r, &input, None, record(&log, "read")).is_ok();
    t.check("read submitted", ok, "submit failed");
    t.check("write buffer lent", out.is_lent(), "not lent");

    let done = pump_until(engine, &log, 2);
    let got = logged(&log);
    t.check("both completions dispatched", done, &format!("{:?}", got));
    t.check("write: 13 bytes", got.contains(&("write", 0, 13)), &format!("{:?}", got));
    t.check("read: 13 bytes", got.contains(&("read", 0, 13)), &format!("{:?}", got));
    let data = input.to_vec().unwrap_or_default();
    t.check("read data matches", data.starts_with(b"hello, cport!"), "mismatch");
    t.check("outstanding back to 0", engine.outstanding() == 0, &engine.outstanding().to_string());

    close(r);
    close(w);
}

// ════════════════════════════════════════════════════════════
// Part C: Datagrams
// ════════════════════════════════════════════════════════════

fn test_datagrams<P: CompletionPort>(t: &mut TestRunner, engine: &mut Engine<P>) {
    t.section("Part C: Datagrams (send_to / recv_from)");

    let (Ok(a), Ok(b)) = (UdpSocket::bind("127.0.0.1:0"), UdpSocket::bind("127.0.0.1:0")) else {
        t.fail("bind udp pair", "failed");
        return;
    };
    let a_port = a.local_addr().map(|s| s.port()).unwrap_or(0);
    let b_port = b.local_addr().map(|s| s.port()).unwrap_or(0);

    let log: Log = Arc::default();
    let rx = engine.allocate_buffer(64);
    let rx_addr = engine.allocate_address_buffer();
    let tx = engine.allocate_buffer(4);
    tx.fill(b"ping");

    let ok = engine.recv_from(a.as_raw_fd(), &rx, &rx_addr, None, 0, record(&log, "recv")).is_ok();
    t.check("recv_from submitted", ok, "submit failed");
    let ok = engine
        .send_to(b.as_raw_fd(), &tx, Destination::inet("127.0.0.1", a_port), None, 0, record(&log, "send"))
        .is_ok();
    t.check("send_to submitted", ok, "submit failed");

    pump_until(engine, &log, 2);
    let got = logged(&log);
    t.check("send_to: 4 bytes", got.contains(&("send", 0, 4)), &format!("{:?}", got));
    t.check("recv_from: 4 bytes", got.contains(&("recv", 0, 4)), &format!("{:?}", got));

    let from = engine.decode_address(&rx_addr);
    t.check(
        "source address decoded",
        from == Address::inet(Ipv4Addr::LOCALHOST, b_port),
        &from.to_string(),
    );

    match engine.encode_address(libc::AF_INET, "127.0.0.1", 4000) {
        Ok(buf) => {
            let back = engine.decode_address(&buf);
            t.check(
                "encode → decode round trip",
                back.host_port() == Some(("127.0.0.1".to_string(), 4000)),
                &back.to_string(),
            );
        }
        Err(e) => t.fail("encode_address", &e.to_string()),
    }
    t.check(
        "decode(empty) is None",
        engine.decode_address(&engine.allocate_buffer(0)).is_none(),
        "not None",
    );
}

// ════════════════════════════════════════════════════════════
// Part D: Streams
// ════════════════════════════════════════════════════════════

fn test_streams<P: CompletionPort>(t: &mut TestRunner, engine: &mut Engine<P>) {
    t.section("Part D: Streams (accept / connect)");

    let Ok(listener) = TcpListener::bind("127.0.0.1:0") else {
        t.fail("bind listener", "failed");
        return;
    };
    let port = listener.local_addr().map(|s| s.port()).unwrap_or(0);
    let accept_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    let client = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    t.check("sockets created", accept_fd >= 0 && client >= 0, "socket() failed");

    let log: Log = Arc::default();
    let out = engine.allocate_accept_buffer();
    let ok = engine.accept(listener.as_raw_fd(), accept_fd, &out, record(&log, "accept")).is_ok();
    t.check("accept submitted", ok, "submit failed");
    let ok = engine
        .connect(client, Destination::inet("127.0.0.1", port), record(&log, "connect"))
        .is_ok();
    t.check("connect submitted", ok, "submit failed");

    pump_until(engine, &log, 2);
    let got = logged(&log);
    t.check("accept: (0, 0)", got.contains(&("accept", 0, 0)), &format!("{:?}", got));
    t.check("connect: (0, 0)", got.contains(&("connect", 0, 0)), &format!("{:?}", got));

    let (local, remote) = engine.accept_addresses(&out);
    t.check(
        "accept local address",
        local == Address::inet(Ipv4Addr::LOCALHOST, port),
        &local.to_string(),
    );
    t.check("accept remote address", matches!(remote, Address::Inet(_)), &remote.to_string());

    // Round trip a byte over the accepted handle.
    let log: Log = Arc::default();
    let tx = engine.allocate_buffer(1);
    tx.fill(b"!");
    let rx = engine.allocate_buffer(1);
    let _ = engine.write(client, &tx, None, record(&log, "c-write"));
    let _ = engine.read(accept_fd, &rx, None, record(&log, "s-read"));
    pump_until(engine, &log, 2);
    t.check(
        "byte arrives on accept handle",
        rx.to_vec().as_deref() == Some(b"!".as_slice()),
        &format!("{:?}", logged(&log)),
    );

    close(client);
    close(accept_fd);
}

// ════════════════════════════════════════════════════════════
// Part E: Dispatch
// ════════════════════════════════════════════════════════════

fn test_dispatch<P: CompletionPort>(t: &mut TestRunner, engine: &mut Engine<P>) {
    t.section("Part E: Dispatch");

    let log: Log = Arc::default();
    match engine.inject_event(record(&log, "inject")) {
        Ok(token) => {
            let outcome = engine.pump(Some(Duration::from_secs(1)));
            t.check(
                "inject_event dispatched by next pump",
                matches!(outcome, Ok(PumpOutcome::Dispatched { token: tk, error: 0, bytes: 0 }) if tk == token),
                &format!("{:?}", outcome),
            );
        }
        Err(e) => t.fail("inject_event", &e.to_string()),
    }

    let n = 32;
    let log: Log = Arc::default();
    for _ in 0..n {
        let _ = engine.inject_event(record(&log, "batch"));
    }
    for _ in 0..n {
        let _ = engine.pump(Some(Duration::from_secs(1)));
    }
    t.check(&format!("{} injects → {} dispatches", n, n), logged(&log).len() == n, &logged(&log).len().to_string());

    let injector = engine.injector();
    let log: Log = Arc::default();
    let remote = record(&log, "posted");
    let poster = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        injector.post(remote)
    });
    let outcome = engine.pump(None);
    let posted = poster.join().map(|r| r.is_ok()).unwrap_or(false);
    t.check("injector post from thread", posted, "post failed");
    t.check(
        "blocked pump woken by injector",
        matches!(outcome, Ok(PumpOutcome::Dispatched { .. })) && logged(&log) == vec![("posted", 0, 0)],
        &format!("{:?}", outcome),
    );

    let start = Instant::now();
    let outcome = engine.pump(Some(Duration::from_millis(50)));
    t.check(
        "idle pump times out",
        matches!(outcome, Ok(PumpOutcome::Timeout)) && start.elapsed() >= Duration::from_millis(40),
        &format!("{:?}", outcome),
    );
}

// ════════════════════════════════════════════════════════════
// Part F: Submit-time errors
// ════════════════════════════════════════════════════════════

fn test_errors<P: CompletionPort>(t: &mut TestRunner, engine: &mut Engine<P>) {
    t.section("Part F: Submit-time errors");

    let before = engine.outstanding();
    let buf = engine.allocate_buffer(8);

    let r = engine.write(1, &buf, Some(0), |_, _| {});
    t.check("length 0 → InvalidArgument", matches!(r, Err(CportError::InvalidArgument(_))), &format!("{:?}", r));
    let r = engine.write(1, &buf, Some(9), |_, _| {});
    t.check("length > capacity → InvalidArgument", matches!(r, Err(CportError::InvalidArgument(_))), &format!("{:?}", r));
    let r = engine.connect(0, Destination { family: libc::AF_INET6, host: "::1", port: 80 }, |_, _| {});
    t.check(
        "AF_INET6 → UnsupportedAddressFamily",
        matches!(r, Err(CportError::UnsupportedAddressFamily(_))),
        &format!("{:?}", r),
    );
    let r = engine.send_to(0, &buf, Destination::inet("localhost", 80), None, 0, |_, _| {});
    t.check("bad host → InvalidArgument", matches!(r, Err(CportError::InvalidArgument(_))), &format!("{:?}", r));
    t.check("outstanding unchanged", engine.outstanding() == before, &engine.outstanding().to_string());
}

// ════════════════════════════════════════════════════════════
// Part G: Shutdown
// ════════════════════════════════════════════════════════════

fn test_shutdown<P: CompletionPort>(t: &mut TestRunner, engine: Engine<P>) {
    t.section("Part G: Shutdown");

    let stats = engine.stats();
    println!(
        "       submitted={} refused={} dispatched={} injected={} timeouts={}",
        stats.submitted, stats.refused, stats.dispatched, stats.injected, stats.timeouts
    );
    let leaked = engine.shutdown();
    t.check("nothing leaked", leaked == 0, &leaked.to_string());
}

fn run<P: CompletionPort>(t: &mut TestRunner, mut engine: Engine<P>) {
    test_init(t, &engine);
    test_file_io(t, &mut engine);
    test_datagrams(t, &mut engine);
    test_streams(t, &mut engine);
    test_dispatch(t, &mut engine);
    test_errors(t, &mut engine);
    test_shutdown(t, engine);
}

fn main() {
    let inline = std::env::args().any(|a| a == "--inline")
        || env_get_str("CPORT_BACKEND", "io_uring") == "inline";

    println!("cport smoke test");
    let mut t = TestRunner::new();
    let builder = EngineBuilder::from_env();

    let built = if inline {
        builder.build_inline().map(|e| run(&mut t, e))
    } else {
        builder.build().map(|e| run(&mut t, e))
    };
    if let Err(e) = built {
        t.fail("engine build", &e.to_string());
    }

    t.summary();
    std::process::exit(if t.failed == 0 { 0 } else { 1 });
}
