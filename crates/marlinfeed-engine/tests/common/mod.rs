//! Shared test rig: a scripted printer on the far end of an in-memory
//! duplex link.

use std::collections::VecDeque;
use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio_util::sync::CancellationToken;

use marlinfeed_engine::{
    injection_channel, Connect, Injector, PauseSwitch, ProtocolEngine, StateHandle,
};

pub const WRAP_LINE: &str = "N99M110N-1*97";

/// Hands out pre-arranged duplex streams to the engine, one per connect.
pub struct MockPort {
    streams: VecDeque<DuplexStream>,
}

impl MockPort {
    pub fn with_streams(streams: Vec<DuplexStream>) -> Self {
        MockPort {
            streams: streams.into(),
        }
    }
}

impl Connect for MockPort {
    type Stream = DuplexStream;

    async fn connect(&mut self) -> io::Result<DuplexStream> {
        self.streams
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "printer device gone"))
    }
}

/// The printer side of the conversation, driven line by line from the
/// test body for full control over ordering.
pub struct Printer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    tx: WriteHalf<DuplexStream>,
    /// Every line the "printer" has read so far.
    pub received: Vec<String>,
}

impl Printer {
    pub fn new(stream: DuplexStream) -> Self {
        let (rx, tx) = tokio::io::split(stream);
        Printer {
            lines: BufReader::new(rx).lines(),
            tx,
            received: Vec::new(),
        }
    }

    /// Reads the next line from the host, recording it.
    pub async fn read_line(&mut self) -> String {
        let line = self
            .lines
            .next_line()
            .await
            .expect("printer side read failed")
            .expect("host closed the link");
        self.received.push(line.clone());
        line
    }

    /// Like [`read_line`](Printer::read_line), but yields `None` when the
    /// host side has closed the link.
    pub async fn try_read_line(&mut self) -> Option<String> {
        match self.lines.next_line().await {
            Ok(Some(line)) => {
                self.received.push(line.clone());
                Some(line)
            }
            _ => None,
        }
    }

    pub async fn say(&mut self, text: &str) {
        self.tx
            .write_all(text.as_bytes())
            .await
            .expect("printer side write failed");
    }

    /// Services the resync: consumes host probes until the wrap-around
    /// frame arrives, then acknowledges it so the handshake succeeds.
    pub async fn serve_handshake(&mut self) {
        loop {
            let line = self.read_line().await;
            if line == WRAP_LINE {
                self.say("ok\n").await;
                return;
            }
        }
    }

    /// Reads one line and immediately acknowledges it.
    pub async fn ack_next(&mut self) -> String {
        let line = self.read_line().await;
        self.say("ok\n").await;
        line
    }
}

/// Everything a dialogue test needs, wired together.
pub struct Rig {
    pub engine: ProtocolEngine<MockPort>,
    pub printer: Printer,
    pub state: StateHandle,
    pub pause: PauseSwitch,
    pub abort: CancellationToken,
    pub injector: Injector,
}

pub fn rig() -> Rig {
    let (host_end, printer_end) = tokio::io::duplex(16 * 1024);
    rig_with_streams(vec![host_end], printer_end)
}

pub fn rig_with_streams(host_streams: Vec<DuplexStream>, printer_end: DuplexStream) -> Rig {
    let state = StateHandle::new();
    let pause = PauseSwitch::new();
    let abort = CancellationToken::new();
    let (injector, inject_rx) = injection_channel();
    let engine = ProtocolEngine::new(
        MockPort::with_streams(host_streams),
        state.clone(),
        pause.clone(),
        abort.clone(),
        inject_rx,
    );
    Rig {
        engine,
        printer: Printer::new(printer_end),
        state,
        pause,
        abort,
        injector,
    }
}

/// XOR-checksummed frame text for a payload and line number, newline not
/// included (the printer side reads whole lines).
pub fn frame(number: usize, payload: &str) -> String {
    let body = format!("N{}{}", number, payload);
    let chk = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{}*{}", body, chk)
}
