//! End-to-end pipeline tests: packets queued into a running engine, decoded
//! through a small synthetic protocol family, reassembled and parsed.
//!
//! Wire formats used here:
//!   fragment datagram: [key u8, offset u8, last u8, payload...]
//!   stream segment:    [key u8, dir u8, seq u32 BE, ack u32 BE, payload...]

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;

use flowtap::{
    CoreError, Decoder, Direction, Dispatcher, Engine, EngineConfig, FragmentConfig, LineParser,
    Multipart, Packet, PayloadView, ProcessStack, ProcessVerdict, Result, Stream, StreamHandler,
    Timestamp,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Terminal layer recording every payload it sees
struct CaptureDecoder {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl CaptureDecoder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().clone()
    }
}

impl Decoder for CaptureDecoder {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn process(
        &self,
        _core: &Dispatcher,
        pkt: &Packet,
        stack: &mut ProcessStack,
        index: usize,
    ) -> Result<ProcessVerdict> {
        let view = stack.slot(index).pload.ok_or(CoreError::Decoder {
            decoder: "capture",
            reason: "no payload".into(),
        })?;
        self.seen.lock().push(view.slice(pkt)?.to_vec());
        Ok(ProcessVerdict::Continue)
    }
}

/// Datagram layer with fragmentation: chains live in session state, expire
/// on a logical-time timer, and completed chains resume at the layer above
struct FragDecoder {
    target: Arc<dyn Decoder>,
}

impl Decoder for FragDecoder {
    fn name(&self) -> &'static str {
        "frag"
    }

    fn process(
        &self,
        core: &Dispatcher,
        pkt: &Packet,
        stack: &mut ProcessStack,
        index: usize,
    ) -> Result<ProcessVerdict> {
        let view = stack.slot(index).pload.ok_or(CoreError::Decoder {
            decoder: "frag",
            reason: "no payload".into(),
        })?;
        let bytes = view.slice(pkt)?;
        if bytes.len() < 3 {
            return Ok(ProcessVerdict::Invalid);
        }
        let key = bytes[0] as u64;
        let offset = bytes[1] as usize;
        let last = bytes[2] == 1;
        let payload = view.narrow(3, view.len - 3)?;

        let session = core.sessions().lookup_or_create(key, pkt.ts())?;
        let complete = {
            let mut state = session.lock();
            let fresh = state.private.is_none();
            let slot = state.private.get_or_insert_with(|| {
                Box::new(Multipart::new(self.target.clone(), 0)) as Box<dyn Any + Send>
            });
            let chain = slot
                .downcast_mut::<Multipart>()
                .ok_or_else(|| CoreError::Session("session state is not a chain".into()))?;
            chain.add_fragment(core.stats(), pkt, payload, offset, last)?;

            if fresh {
                let weak = Arc::downgrade(&session);
                let stats = core.stats().clone();
                let deadline =
                    pkt.ts() + Duration::seconds(core.config().fragment.timeout_secs as i64);
                core.timers().schedule(deadline, move |_| {
                    if let Some(entry) = weak.upgrade() {
                        if let Some(private) = entry.lock().private.as_mut() {
                            if let Some(chain) = private.downcast_mut::<Multipart>() {
                                chain.abandon(&stats);
                            }
                        }
                    }
                });
            }
            chain.is_complete()
        };

        if complete {
            // The chain is done with the session; pull it out and drop the
            // lock before re-injecting, since the resumed walk may look this
            // session up again
            let chain = session.lock().private.take();
            if let Some(mut chain) = chain.and_then(|p| p.downcast::<Multipart>().ok()) {
                chain.process(core, index + 1)?;
            }
        }

        core.sessions()
            .delayed_cleanup(&session, core.config().session.timeout_secs, pkt.ts());
        stack.slot_mut(index).set_session(session);
        Ok(ProcessVerdict::Stop)
    }
}

/// Terminal layer that re-opens the session its datagram came from; the
/// leading payload byte is the chain key by construction
struct SessionPeekDecoder {
    seen: Mutex<Vec<Vec<u8>>>,
}

impl SessionPeekDecoder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.seen.lock().clone()
    }
}

impl Decoder for SessionPeekDecoder {
    fn name(&self) -> &'static str {
        "peek"
    }

    fn process(
        &self,
        core: &Dispatcher,
        pkt: &Packet,
        stack: &mut ProcessStack,
        index: usize,
    ) -> Result<ProcessVerdict> {
        let view = stack.slot(index).pload.ok_or(CoreError::Decoder {
            decoder: "peek",
            reason: "no payload".into(),
        })?;
        let bytes = view.slice(pkt)?.to_vec();
        let key = *bytes.first().ok_or(CoreError::Decoder {
            decoder: "peek",
            reason: "empty payload".into(),
        })?;

        let session = core.sessions().lookup_or_create(key as u64, pkt.ts())?;
        session.lock().expires_at = Some(pkt.ts() + Duration::seconds(30));
        stack.slot_mut(index).set_session(session);

        self.seen.lock().push(bytes);
        Ok(ProcessVerdict::Stop)
    }
}

type Transcript = Arc<Mutex<HashMap<(u8, u8), Vec<String>>>>;

/// Feeds in-order stream bytes through a line parser into the transcript
struct LineHandler {
    key: u8,
    parsers: [LineParser; 2],
    transcript: Transcript,
}

impl StreamHandler for LineHandler {
    fn deliver(
        &mut self,
        _dispatcher: &Dispatcher,
        pkt: &Packet,
        view: PayloadView,
        dir: Direction,
        _stack: &mut ProcessStack,
        _index: usize,
    ) -> Result<()> {
        let parser = &mut self.parsers[dir.index()];
        parser.add_payload(view.slice(pkt)?);
        while let Some(line) = parser.next_line()? {
            self.transcript
                .lock()
                .entry((self.key, dir.index() as u8))
                .or_default()
                .push(String::from_utf8_lossy(&line).into_owned());
        }
        Ok(())
    }
}

/// Transport layer feeding a per-session ordered stream of text lines
struct TextStreamDecoder {
    transcript: Transcript,
    max_line: usize,
}

impl Decoder for TextStreamDecoder {
    fn name(&self) -> &'static str {
        "txt"
    }

    fn process(
        &self,
        core: &Dispatcher,
        pkt: &Packet,
        stack: &mut ProcessStack,
        index: usize,
    ) -> Result<ProcessVerdict> {
        let view = stack.slot(index).pload.ok_or(CoreError::Decoder {
            decoder: "txt",
            reason: "no payload".into(),
        })?;
        let bytes = view.slice(pkt)?;
        if bytes.len() < 10 {
            return Ok(ProcessVerdict::Invalid);
        }
        let key = bytes[0];
        let dir = if bytes[1] == 0 {
            Direction::ToServer
        } else {
            Direction::ToClient
        };
        let seq = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        let ack = u32::from_be_bytes(bytes[6..10].try_into().unwrap());
        let payload = view.narrow(10, view.len - 10)?;

        let session = core.sessions().lookup_or_create(key as u64, pkt.ts())?;
        let stream: Arc<Stream> = {
            let mut state = session.lock();
            let transcript = self.transcript.clone();
            let max_line = self.max_line;
            let stats = core.stats().clone();
            let config = core.config().stream.clone();
            let slot = state.private.get_or_insert_with(move || {
                let handler = LineHandler {
                    key,
                    parsers: [LineParser::new(max_line), LineParser::new(max_line)],
                    transcript,
                };
                Box::new(Stream::new(&config, stats, Box::new(handler))) as Box<dyn Any + Send>
            });
            slot.downcast_ref::<Arc<Stream>>()
                .cloned()
                .ok_or_else(|| CoreError::Session("session state is not a stream".into()))?
        };

        stack.slot_mut(index + 1).pload = Some(payload);
        stream.process_segment(core, pkt, stack, index + 1, dir, seq, ack)?;

        core.sessions()
            .delayed_cleanup(&session, core.config().session.timeout_secs, pkt.ts());
        stack.slot_mut(index).set_session(session);
        Ok(ProcessVerdict::Stop)
    }
}

fn frag_bytes(key: u8, offset: u8, last: bool, payload: &[u8]) -> Vec<u8> {
    let mut b = vec![key, offset, last as u8];
    b.extend_from_slice(payload);
    b
}

fn seg_bytes(key: u8, dir: u8, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let mut b = vec![key, dir];
    b.extend_from_slice(&seq.to_be_bytes());
    b.extend_from_slice(&ack.to_be_bytes());
    b.extend_from_slice(payload);
    b
}

/// Monotonic timestamps so the clock watermark advances deterministically
struct TsGen {
    base: Timestamp,
    step: i64,
}

impl TsGen {
    fn new() -> Self {
        Self {
            base: Utc::now(),
            step: 0,
        }
    }

    fn next(&mut self) -> Timestamp {
        self.step += 1;
        self.base + Duration::milliseconds(self.step)
    }
}

#[test]
fn test_fragmented_datagrams_end_to_end() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default().with_workers(1));
    let capture = CaptureDecoder::new();
    let frag: Arc<dyn Decoder> = Arc::new(FragDecoder {
        target: capture.clone(),
    });
    engine.register_decoder(capture.clone()).unwrap();
    engine.register_decoder(frag.clone()).unwrap();
    engine.start().unwrap();

    let source = engine.source("replay0");
    let mut ts = TsGen::new();
    // Two chains, fragments interleaved and out of order within each
    let wire = [
        frag_bytes(1, 6, true, b"world"),
        frag_bytes(2, 0, false, b"flow"),
        frag_bytes(1, 0, false, b"hello "),
        frag_bytes(2, 4, true, b" tap!"),
    ];
    for bytes in &wire {
        let pkt = source.packet(ts.next(), frag.clone(), bytes);
        engine.queue_packet(pkt, Some(bytes[0] as u64)).unwrap();
    }
    engine.stop();

    let mut seen = capture.payloads();
    seen.sort();
    assert_eq!(seen, vec![b"flow tap!".to_vec(), b"hello world".to_vec()]);

    let stats = engine.stats();
    assert_eq!(stats.reassembled_packets, 2);
    assert_eq!(stats.fragments_received, 4);
    assert_eq!(stats.fragments_dropped, 0);

    // Drain flushed the session table, and every pooled buffer came home
    assert_eq!(engine.dispatcher().sessions().session_count(), 0);
    let pool = engine.pool().stats();
    assert_eq!(pool.acquired, pool.returned);
}

#[test]
fn test_resumed_walk_reuses_originating_session() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default().with_workers(1));
    let peek = SessionPeekDecoder::new();
    let frag: Arc<dyn Decoder> = Arc::new(FragDecoder {
        target: peek.clone(),
    });
    engine.register_decoder(peek.clone()).unwrap();
    engine.register_decoder(frag.clone()).unwrap();
    engine.start().unwrap();

    let source = engine.source("replay0");
    let mut ts = TsGen::new();
    // The layer above the reassembly point locks the same session the chain
    // lived in; completion must not still hold that lock
    let wire = [
        frag_bytes(5, 0, false, b"\x05he"),
        frag_bytes(5, 3, true, b"llo"),
    ];
    for bytes in &wire {
        let pkt = source.packet(ts.next(), frag.clone(), bytes);
        engine.queue_packet(pkt, None).unwrap();
    }
    engine.stop();

    assert_eq!(peek.payloads(), vec![b"\x05hello".to_vec()]);
}

#[test]
fn test_fragment_chain_times_out() {
    init_tracing();
    let engine = Engine::new(EngineConfig {
        fragment: FragmentConfig { timeout_secs: 60 },
        ..EngineConfig::default().with_workers(1)
    });
    let capture = CaptureDecoder::new();
    let frag: Arc<dyn Decoder> = Arc::new(FragDecoder {
        target: capture.clone(),
    });
    engine.register_decoder(capture.clone()).unwrap();
    engine.register_decoder(frag.clone()).unwrap();
    engine.start().unwrap();

    let source = engine.source("replay0");
    let t0 = Utc::now();

    // A chain that never completes...
    let head = source.packet(t0, frag.clone(), &frag_bytes(1, 0, false, b"orphan"));
    engine.queue_packet(head, None).unwrap();
    // ...then a complete datagram two minutes later pushes the clock past
    // the chain's deadline
    let late = source.packet(
        t0 + Duration::seconds(120),
        frag.clone(),
        &frag_bytes(2, 0, true, b"prompt"),
    );
    engine.queue_packet(late, None).unwrap();
    engine.stop();

    assert_eq!(capture.payloads(), vec![b"prompt".to_vec()]);
    let stats = engine.stats();
    assert_eq!(stats.fragments_dropped, 1);
    assert_eq!(stats.reassembled_packets, 1);
}

#[test]
fn test_stream_lines_per_session_with_affinity() {
    init_tracing();
    let transcript: Transcript = Arc::new(Mutex::new(HashMap::new()));
    let engine = Engine::new(EngineConfig::default().with_workers(2));
    let txt: Arc<dyn Decoder> = Arc::new(TextStreamDecoder {
        transcript: transcript.clone(),
        max_line: 128,
    });
    engine.register_decoder(txt.clone()).unwrap();
    engine.start().unwrap();

    let source = engine.source("replay0");
    let mut ts = TsGen::new();
    // Per session: "HELLO\r\nWORLD\r\n" cut at 9 and 11, middle piece last
    let cuts: [(u32, &[u8]); 3] = [
        (0, b"HELLO\r\nWO"),
        (11, b"D\r\n"),
        (9, b"RL"),
    ];
    for key in [1u8, 2u8] {
        for &(seq, chunk) in &cuts {
            let bytes = seg_bytes(key, 0, seq, 0, chunk);
            let pkt = source.packet(ts.next(), txt.clone(), &bytes);
            engine.queue_packet(pkt, Some(key as u64)).unwrap();
        }
        // One reply line the other way
        let bytes = seg_bytes(key, 1, 500, 14, b"OK\r\n");
        let pkt = source.packet(ts.next(), txt.clone(), &bytes);
        engine.queue_packet(pkt, Some(key as u64)).unwrap();
    }
    engine.stop();

    let transcript = transcript.lock();
    for key in [1u8, 2u8] {
        assert_eq!(
            transcript.get(&(key, 0)),
            Some(&vec!["HELLO".to_string(), "WORLD".to_string()]),
            "session {key} to-server lines"
        );
        assert_eq!(
            transcript.get(&(key, 1)),
            Some(&vec!["OK".to_string()]),
            "session {key} to-client lines"
        );
    }

    let stats = engine.stats();
    // The piece at 11 waited for the piece at 9, in both sessions
    assert_eq!(stats.segments_buffered, 2);
    assert_eq!(stats.segments_delivered, 8);
}

#[test]
fn test_oversized_line_halts_engine() {
    init_tracing();
    let transcript: Transcript = Arc::new(Mutex::new(HashMap::new()));
    let engine = Engine::new(EngineConfig::default().with_workers(1));
    let txt: Arc<dyn Decoder> = Arc::new(TextStreamDecoder {
        transcript,
        max_line: 8,
    });
    engine.register_decoder(txt.clone()).unwrap();
    engine.start().unwrap();

    let source = engine.source("replay0");
    let bytes = seg_bytes(7, 0, 0, 0, &[b'A'; 64]);
    let pkt = source.packet(Utc::now(), txt.clone(), &bytes);
    engine.queue_packet(pkt, None).unwrap();

    for _ in 0..500 {
        if engine.halt_reason().is_some() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    let reason = engine.halt_reason().expect("engine should have halted");
    assert!(reason.contains("line"), "unexpected halt reason: {reason}");
    engine.stop();
}

#[test]
fn test_feeder_bridges_capture_thread() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default().with_workers(2));
    let capture = CaptureDecoder::new();
    engine.register_decoder(capture.clone()).unwrap();
    engine.start().unwrap();

    let (tx, bridge) = engine.feeder(32);
    let source = engine.source("eth0");
    let producer = {
        let capture = capture.clone();
        std::thread::spawn(move || {
            let mut ts = TsGen::new();
            for i in 0..100u32 {
                let pkt = source.packet(ts.next(), capture.clone(), &i.to_be_bytes());
                tx.send((pkt, None)).unwrap();
            }
        })
    };
    producer.join().unwrap();
    bridge.join().unwrap();
    engine.stop();

    assert_eq!(capture.payloads().len(), 100);
    assert_eq!(engine.stats().packets_processed, 100);
}

#[test]
fn test_unregister_decoder_while_running() {
    init_tracing();
    let engine = Engine::new(EngineConfig::default().with_workers(2));
    let capture = CaptureDecoder::new();
    engine.register_decoder(capture.clone()).unwrap();
    engine.start().unwrap();

    assert!(engine.unregister_decoder("capture").is_some());
    assert!(engine.unregister_decoder("capture").is_none());
    engine.stop();
}
