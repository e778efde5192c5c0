// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests: a line-framed toy
//! protocol, a single-target router, an echoing backend server, and a
//! blocking test client.

use bytes::Bytes;
use shunt::config::{Config, ListenerConfig, TargetConfig};
use shunt::core::errors::ShuntError;
use shunt::core::ids::TargetId;
use shunt::core::protocol::{
    ClientEvent, ClientPacket, ParseResult, ProtocolFactory, ProtocolModule, RecoveryAction,
    ReplyDisposition, ReplyShape, RoutePlan, RouterFactory, RouterModule, SessionView, Statement,
    StatementKind,
};
use shunt::server::buffer::ChunkQueue;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Sets up minimal tracing for tests (ignore error if already initialized).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Canonical form of a line statement: literal digit runs collapse to a
/// placeholder so logically identical queries collide in the cache.
pub fn fingerprint_of(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_digits = false;
    for c in line.trim_end().chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('?');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.push(c);
        }
    }
    out
}

fn split_line(buf: &mut ChunkQueue) -> Option<Bytes> {
    let position = buf.coalesced().iter().position(|b| *b == b'\n')?;
    Some(buf.split_to(position + 1))
}

/// A newline-framed wire protocol: every line is one statement, every
/// backend line is one terminal reply. Authentication is implicit; the
/// first client bytes complete it.
pub struct LineProtocol {
    authed: bool,
}

impl LineProtocol {
    pub fn new() -> Self {
        Self { authed: false }
    }
}

impl ProtocolModule for LineProtocol {
    fn on_client_bytes(
        &mut self,
        buf: &mut ChunkQueue,
        out: &mut Vec<ClientEvent>,
    ) -> Result<(), ShuntError> {
        if !self.authed {
            self.authed = true;
            out.push(ClientEvent::AuthSucceeded);
        }
        while let Some(payload) = split_line(buf) {
            let line = std::str::from_utf8(&payload)
                .map_err(|_| ShuntError::MalformedPacket("statement is not utf-8".into()))?
                .trim_end()
                .to_string();
            if line == "QUIT" {
                out.push(ClientEvent::Quit);
                continue;
            }
            out.push(ClientEvent::Packet(ClientPacket {
                payload,
                fingerprint: Some(fingerprint_of(&line).into_boxed_str()),
            }));
        }
        Ok(())
    }

    fn parse(&mut self, packet: &ClientPacket) -> ParseResult {
        let line = String::from_utf8_lossy(&packet.payload);
        let line = line.trim_end();
        let word = line.split_whitespace().next().unwrap_or("");
        let kind = match word {
            "SELECT" | "SLEEP" => StatementKind::Read,
            "INSERT" | "UPDATE" | "DELETE" => StatementKind::Write,
            "SET" => StatementKind::SessionState,
            "BEGIN" => StatementKind::Begin,
            "COMMIT" => StatementKind::Commit,
            "ROLLBACK" => StatementKind::Rollback,
            _ => StatementKind::Other,
        };
        ParseResult {
            kind,
            is_write: matches!(kind, StatementKind::Write),
            touches_session_state: kind == StatementKind::SessionState,
            size_hint: packet.payload.len(),
        }
    }

    fn serialize_for_backend(&mut self, stmt: &Statement, transform: Option<&Bytes>) -> Bytes {
        transform.cloned().unwrap_or_else(|| stmt.packet.payload.clone())
    }

    fn on_backend_bytes(
        &mut self,
        _target: TargetId,
        buf: &mut ChunkQueue,
        out: &mut Vec<Bytes>,
    ) -> Result<(), ShuntError> {
        while let Some(packet) = split_line(buf) {
            out.push(packet);
        }
        Ok(())
    }

    fn error_reply(&self, err: &ShuntError) -> Bytes {
        Bytes::from(format!("ERR {err}\n"))
    }
}

/// Routes every statement to one fixed target and forwards every reply.
pub struct SingleTargetRouter {
    target: TargetId,
}

impl SingleTargetRouter {
    pub fn new(target: TargetId) -> Self {
        Self { target }
    }
}

impl RouterModule for SingleTargetRouter {
    fn on_statement(
        &mut self,
        _stmt: &Statement,
        _view: &SessionView<'_>,
    ) -> Result<RoutePlan, ShuntError> {
        Ok(RoutePlan {
            targets: vec![self.target],
            reply_shape: ReplyShape::Single,
            transform: None,
        })
    }

    fn on_reply(
        &mut self,
        _target: TargetId,
        _packet: &Bytes,
        _view: &SessionView<'_>,
    ) -> ReplyDisposition {
        ReplyDisposition {
            append_to_client: true,
            is_terminal: true,
            next_expected: None,
        }
    }

    fn on_failure(
        &mut self,
        _target: TargetId,
        err: &ShuntError,
        _view: &SessionView<'_>,
    ) -> RecoveryAction {
        RecoveryAction::Surface(err.clone())
    }
}

pub fn line_protocol_factory() -> Arc<dyn ProtocolFactory> {
    Arc::new(|| Box::new(LineProtocol::new()) as Box<dyn ProtocolModule>)
}

pub fn single_target_router_factory(target: TargetId) -> Arc<dyn RouterFactory> {
    Arc::new(move || Box::new(SingleTargetRouter::new(target)) as Box<dyn RouterModule>)
}

/// A listener declaration wired to the toy protocol and router.
pub fn line_listener(target: TargetId) -> ListenerConfig {
    ListenerConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        line_protocol_factory(),
        single_target_router_factory(target),
    )
}

/// A config sized for tests: fast ticks, generous timeouts.
pub fn test_config(worker_count: usize) -> Config {
    Config {
        worker_count,
        loop_tick: Duration::from_millis(20),
        multiplex_timeout: Duration::from_secs(10),
        ..Config::default()
    }
}

/// A threaded line-echo server standing in for a database: echoes each
/// line back, honoring `SLEEP <ms>` lines by delaying the echo.
pub struct EchoBackend {
    pub addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
}

impl EchoBackend {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind echo backend");
        let addr = listener.local_addr().expect("echo backend addr");
        let accepts = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let accepts_inner = Arc::clone(&accepts);
        let stop_inner = Arc::clone(&stop);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                if stop_inner.load(Ordering::Acquire) {
                    break;
                }
                let Ok(stream) = stream else { break };
                accepts_inner.fetch_add(1, Ordering::AcqRel);
                std::thread::spawn(move || serve_echo(stream));
            }
        });
        Self {
            addr,
            accepts,
            stop,
        }
    }

    /// Connections accepted since start; one per distinct backend socket.
    pub fn accept_count(&self) -> usize {
        self.accepts.load(Ordering::Acquire)
    }

    pub fn target_config(&self, name: &str) -> TargetConfig {
        TargetConfig::new(name, self.addr)
    }
}

impl Drop for EchoBackend {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Nudge the accept loop awake so the thread exits.
        let _ = TcpStream::connect(self.addr);
    }
}

fn serve_echo(stream: TcpStream) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone echo stream"));
    let mut stream = stream;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let trimmed = line.trim_end();
        if let Some(ms) = trimmed
            .strip_prefix("SLEEP ")
            .and_then(|v| v.parse::<u64>().ok())
        {
            std::thread::sleep(Duration::from_millis(ms));
        }
        if stream.write_all(line.as_bytes()).is_err() {
            return;
        }
    }
}

/// A blocking client speaking the line protocol.
pub struct TestClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TestClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to proxy");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("set read timeout");
        let reader = BufReader::new(stream.try_clone().expect("clone client stream"));
        Self { stream, reader }
    }

    pub fn send_line(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\n").as_bytes())
            .expect("write statement");
    }

    /// Reads one reply line, trimmed. Panics on timeout.
    pub fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).expect("read reply");
        assert!(n > 0, "connection closed while awaiting a reply");
        line.trim_end().to_string()
    }

    /// Reads until EOF; returns whatever arrived first.
    pub fn read_to_eof(&mut self) -> String {
        let mut out = String::new();
        let _ = self.reader.read_to_string(&mut out);
        out
    }

    /// A round trip: send one statement, expect one echo line back.
    pub fn query(&mut self, line: &str) -> String {
        self.send_line(line);
        self.read_line()
    }
}

/// Spins until `predicate` holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    predicate()
}
