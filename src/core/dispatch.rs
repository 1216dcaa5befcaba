//! Protocol-stack dispatcher
//!
//! Drives a packet through the decoder stack: a forward walk where each
//! layer classifies its payload view and fills the next slot, then a
//! backward unwind that runs completion hooks and releases session handles.
//! The dispatcher is shared by every worker; per-packet state lives in the
//! `ProcessStack` the caller owns.

use std::sync::Arc;

use tracing::{error, warn};

use crate::config::EngineConfig;
use crate::conntrack::SessionTracker;
use crate::core::decoder::DecoderRegistry;
use crate::core::packet::{Packet, PacketPool};
use crate::core::stack::{PayloadView, ProcessStack};
use crate::error::{ProcessVerdict, Result};
use crate::stats::CoreStats;
use crate::timer::TimerQueue;

/// Shared dispatch context handed to every decoder phase
pub struct Dispatcher {
    config: EngineConfig,
    registry: Arc<DecoderRegistry>,
    sessions: Arc<dyn SessionTracker>,
    timers: Arc<TimerQueue>,
    pool: PacketPool,
    stats: Arc<CoreStats>,
}

impl Dispatcher {
    pub fn new(
        config: EngineConfig,
        registry: Arc<DecoderRegistry>,
        sessions: Arc<dyn SessionTracker>,
        timers: Arc<TimerQueue>,
        stats: Arc<CoreStats>,
    ) -> Self {
        Self {
            config,
            registry,
            sessions,
            timers,
            pool: PacketPool::new(),
            stats,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DecoderRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<dyn SessionTracker> {
        &self.sessions
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.timers
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<CoreStats> {
        &self.stats
    }

    /// Allocate a stack sized for this engine
    pub fn new_stack(&self) -> ProcessStack {
        ProcessStack::new(self.config.stack_depth)
    }

    /// Run one packet through the full decoder stack.
    ///
    /// Slot 0 is reserved so every layer has a valid predecessor; the
    /// datalink decoder is seeded at slot 1 over the whole buffer.
    pub fn process_packet(&self, pkt: &Packet) -> Result<()> {
        let mut stack = self.new_stack();
        stack.seed(1, pkt.datalink().clone(), PayloadView::whole(pkt))?;
        let res = self.dispatch(pkt, &mut stack, 1);
        CoreStats::inc(&self.stats.packets_processed, 1);
        res
    }

    /// Walk the stack from `start`, then unwind and clear.
    ///
    /// Reassembly engines call this to resume a synthesized packet at the
    /// layer above the one that reassembled it.
    pub fn dispatch(&self, pkt: &Packet, stack: &mut ProcessStack, start: usize) -> Result<()> {
        let res = self.walk(pkt, stack, start);
        self.unwind(pkt, stack, start);
        stack.clear_from(start, &self.registry);
        res
    }

    /// Forward walk. Slots are committed on `Continue` or `Stop`; a slot
    /// whose `process` failed or returned `Invalid` is left uncommitted and
    /// skipped by the unwind.
    fn walk(&self, pkt: &Packet, stack: &mut ProcessStack, start: usize) -> Result<()> {
        let mut index = start;
        loop {
            let Some(decoder) = stack.slot(index).decoder.clone() else {
                break;
            };

            if !decoder.fields().is_empty() && stack.slot(index).pkt_info.is_none() {
                if let Some(pool) = self.registry.info_pool(decoder.name()) {
                    stack.slot_mut(index).pkt_info = Some(pool.get());
                }
            }

            match decoder.process(self, pkt, stack, index) {
                Err(e) => {
                    error!(decoder = decoder.name(), packet = pkt.id(), %e, "decoder failed");
                    return Err(e);
                }
                Ok(ProcessVerdict::Invalid) => return Ok(()),
                Ok(ProcessVerdict::Stop) => {
                    stack.slot_mut(index).set_committed(true);
                    return Ok(());
                }
                Ok(ProcessVerdict::Continue) => {
                    stack.slot_mut(index).set_committed(true);
                }
            }

            if index + 1 >= stack.capacity() {
                break;
            }
            if stack.slot(index + 1).pload.is_none() {
                break;
            }

            // The layer below has a payload view; let this layer hand it to
            // its listeners before descending.
            decoder.process_payload(self, pkt, stack, index)?;

            if stack.slot(index + 1).decoder.is_none() {
                break;
            }
            index += 1;
        }
        Ok(())
    }

    /// Backward unwind from the deepest slot to `start`. Completion hooks
    /// run for committed slots only; session handles are released for every
    /// slot that acquired one, exactly once.
    fn unwind(&self, pkt: &Packet, stack: &mut ProcessStack, start: usize) {
        for index in (start..stack.capacity()).rev() {
            if stack.slot(index).committed() {
                if let Some(decoder) = stack.slot(index).decoder.clone() {
                    if let Err(e) = decoder.post_process(self, pkt, stack, index) {
                        warn!(decoder = decoder.name(), packet = pkt.id(), %e, "post-process failed");
                    }
                }
            }
            if let Some(session) = stack.slot_mut(index).take_session() {
                self.sessions.refcount_dec(&session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::conntrack::SessionTable;
    use crate::error::CoreError;
    use crate::core::decoder::Decoder;
    use crate::core::fields::{FieldDescriptor, FieldValue};
    use chrono::Utc;
    use parking_lot::Mutex;

    /// Scripted layer: records phase calls, optionally fills the next slot
    struct ScriptedDecoder {
        name: &'static str,
        verdict: ProcessVerdict,
        next: Option<&'static str>,
        session_key: Option<u64>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedDecoder {
        fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                verdict: ProcessVerdict::Continue,
                next: None,
                session_key: None,
                log,
            }
        }

        fn with_next(mut self, next: &'static str) -> Self {
            self.next = Some(next);
            self
        }

        fn with_verdict(mut self, verdict: ProcessVerdict) -> Self {
            self.verdict = verdict;
            self
        }

        fn with_session(mut self, key: u64) -> Self {
            self.session_key = Some(key);
            self
        }
    }

    static ONE_FIELD: &[FieldDescriptor] = &[FieldDescriptor {
        name: "len",
        description: "payload length",
    }];

    impl Decoder for ScriptedDecoder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn fields(&self) -> &'static [FieldDescriptor] {
            ONE_FIELD
        }

        fn process(
            &self,
            core: &Dispatcher,
            pkt: &Packet,
            stack: &mut ProcessStack,
            index: usize,
        ) -> Result<ProcessVerdict> {
            self.log.lock().push(format!("{}:process", self.name));

            let view = stack.slot(index).pload.ok_or(CoreError::Decoder {
                decoder: self.name,
                reason: "no payload".into(),
            })?;
            if let Some(info) = stack.slot_mut(index).pkt_info.as_mut() {
                info.set(0, FieldValue::U32(view.len as u32));
            }

            if let Some(key) = self.session_key {
                let session = core.sessions().lookup_or_create(key, pkt.ts())?;
                stack.slot_mut(index).set_session(session);
            }

            if matches!(self.verdict, ProcessVerdict::Continue) {
                if let Some(next) = self.next {
                    // Strip a one-byte header
                    let inner = view.narrow(1, view.len - 1)?;
                    let decoder = core.registry().decoder(next).ok_or(CoreError::Decoder {
                        decoder: self.name,
                        reason: format!("unknown next layer {next}"),
                    })?;
                    stack.seed(index + 1, decoder, inner)?;
                }
            }
            Ok(self.verdict)
        }

        fn process_payload(
            &self,
            _core: &Dispatcher,
            _pkt: &Packet,
            _stack: &mut ProcessStack,
            _index: usize,
        ) -> Result<()> {
            self.log.lock().push(format!("{}:payload", self.name));
            Ok(())
        }

        fn post_process(
            &self,
            _core: &Dispatcher,
            _pkt: &Packet,
            _stack: &mut ProcessStack,
            _index: usize,
        ) -> Result<()> {
            self.log.lock().push(format!("{}:post", self.name));
            Ok(())
        }
    }

    fn make_dispatcher() -> (Dispatcher, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(
            EngineConfig::default(),
            Arc::new(DecoderRegistry::new()),
            Arc::new(SessionTable::new(SessionConfig::default())),
            TimerQueue::shared(),
            CoreStats::shared(),
        );
        (dispatcher, log)
    }

    fn register(d: &Dispatcher, decoder: ScriptedDecoder) -> Arc<ScriptedDecoder> {
        let decoder = Arc::new(decoder);
        d.registry().register(decoder.clone()).unwrap();
        decoder
    }

    #[test]
    fn test_walk_then_unwind_in_reverse() {
        let (d, log) = make_dispatcher();
        let link = register(&d, ScriptedDecoder::new("link", log.clone()).with_next("net"));
        register(&d, ScriptedDecoder::new("net", log.clone()).with_next("app"));
        register(&d, ScriptedDecoder::new("app", log.clone()));

        let pkt = d
            .pool()
            .packet_from_slice(1, Utc::now(), link, None, b"\x00\x00hello");
        d.process_packet(&pkt).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "link:process",
                "link:payload",
                "net:process",
                "net:payload",
                "app:process",
                "app:post",
                "net:post",
                "link:post",
            ]
        );
        assert_eq!(d.stats().snapshot().packets_processed, 1);
    }

    #[test]
    fn test_invalid_layer_skipped_by_unwind() {
        let (d, log) = make_dispatcher();
        let link = register(&d, ScriptedDecoder::new("link", log.clone()).with_next("bad"));
        register(
            &d,
            ScriptedDecoder::new("bad", log.clone()).with_verdict(ProcessVerdict::Invalid),
        );

        let pkt = d
            .pool()
            .packet_from_slice(2, Utc::now(), link, None, b"\x00data");
        d.process_packet(&pkt).unwrap();

        // The invalid layer gets no completion hook; committed layers do
        let entries = log.lock().clone();
        assert!(entries.contains(&"bad:process".to_string()));
        assert!(!entries.contains(&"bad:post".to_string()));
        assert!(entries.contains(&"link:post".to_string()));
    }

    #[test]
    fn test_sessions_released_even_on_invalid() {
        let (d, log) = make_dispatcher();
        let link = register(
            &d,
            ScriptedDecoder::new("link", log.clone()).with_next("l4").with_session(10),
        );
        register(
            &d,
            ScriptedDecoder::new("l4", log.clone())
                .with_verdict(ProcessVerdict::Invalid)
                .with_session(11),
        );

        let pkt = d
            .pool()
            .packet_from_slice(3, Utc::now(), link, None, b"\x00abc");
        d.process_packet(&pkt).unwrap();

        // Both handles released exactly once
        let now = Utc::now() + chrono::Duration::days(365);
        assert_eq!(d.sessions().flush_expired(now), 2);
    }

    #[test]
    fn test_info_pools_drain_after_dispatch() {
        let (d, log) = make_dispatcher();
        let link = register(&d, ScriptedDecoder::new("link", log.clone()).with_next("net"));
        register(&d, ScriptedDecoder::new("net", log));

        let pkt = d
            .pool()
            .packet_from_slice(4, Utc::now(), link, None, b"\x00xyz");
        d.process_packet(&pkt).unwrap();

        for name in ["link", "net"] {
            let pool = d.registry().info_pool(name).unwrap();
            assert_eq!(pool.usage(), 0, "{name} pool leaked");
            assert_eq!(pool.high_water(), 1);
        }
    }

    #[test]
    fn test_stack_exhaustion_is_an_error() {
        let (d, log) = make_dispatcher();
        // Each layer points back at itself, never terminating
        let loop_decoder = register(&d, ScriptedDecoder::new("loop", log).with_next("loop"));

        let pkt = d.pool().packet_from_slice(
            5,
            Utc::now(),
            loop_decoder,
            None,
            &[0u8; 64],
        );
        let err = d.process_packet(&pkt).unwrap_err();
        assert!(matches!(err, CoreError::StackExhausted(_)));
    }
}
