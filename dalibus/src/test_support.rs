//! Scripted bridge double used by the test suites.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::comm::{DaliComm, StatusCallback};
use crate::config::BusConfig;
use crate::defs::bridge;
use crate::error::Result;

/// One scripted bridge reaction to an acknowledged request.
#[derive(Debug, Clone, Copy)]
pub enum Reaction {
    /// Backward-frame data byte.
    Data(u8),
    /// Acknowledge code.
    Ack(u8),
    /// No response at all (the bridge itself went away).
    Silence,
}

#[derive(Default)]
struct BridgeState {
    sent: Vec<Vec<u8>>,
    script: VecDeque<Reaction>,
    responder: Option<Box<dyn FnMut(&[u8]) -> Reaction>>,
    inbound: Vec<u8>,
}

/// A fake bridge: records every transmitted frame and answers acknowledged
/// requests from a script or a responder function, feeding the response
/// bytes back through the normal inbound path.
#[derive(Clone, Default)]
pub struct ScriptedBridge {
    state: Rc<RefCell<BridgeState>>,
}

impl ScriptedBridge {
    pub fn new() -> Self {
        ScriptedBridge::default()
    }

    /// Build a DaliComm transmitting into this bridge.
    pub fn comm(&self) -> DaliComm {
        self.comm_with_config(&BusConfig::default())
    }

    pub fn comm_with_config(&self, config: &BusConfig) -> DaliComm {
        let state = self.state.clone();
        DaliComm::new(
            move |bytes: &[u8]| -> Result<usize> {
                let mut st = state.borrow_mut();
                st.sent.push(bytes.to_vec());
                let needs_answer = matches!(
                    bytes.first(),
                    Some(&bridge::CMD_SEND_ACK)
                        | Some(&bridge::CMD_QUERY)
                        | Some(&bridge::CMD_RESET)
                        | Some(&bridge::CMD_EDGE_ADJ)
                );
                // the responder observes every frame (it may track bus
                // state), but only acknowledged requests get an answer
                let reaction = if let Some(scripted) =
                    needs_answer.then(|| st.script.pop_front()).flatten()
                {
                    Some(scripted)
                } else if let Some(responder) = st.responder.as_mut() {
                    let reaction = responder(bytes);
                    needs_answer.then_some(reaction)
                } else if !needs_answer {
                    None
                } else if bytes[0] == bridge::CMD_QUERY {
                    Some(Reaction::Ack(bridge::ACK_TIMEOUT))
                } else {
                    Some(Reaction::Ack(bridge::ACK_OK))
                };
                match reaction {
                    Some(Reaction::Data(b)) => st.inbound.extend([bridge::RESP_DATA, b]),
                    Some(Reaction::Ack(code)) => st.inbound.extend([bridge::RESP_ACK, code]),
                    Some(Reaction::Silence) | None => {}
                }
                Ok(bytes.len())
            },
            config,
            "testbus",
        )
    }

    /// Script the next reaction (consumed in order, before the responder).
    pub fn push(&self, reaction: Reaction) {
        self.state.borrow_mut().script.push_back(reaction);
    }

    pub fn push_data(&self, byte: u8) {
        self.push(Reaction::Data(byte));
    }

    pub fn push_ack(&self, code: u8) {
        self.push(Reaction::Ack(code));
    }

    /// Install a responder consulted when the script is exhausted.
    pub fn set_responder(&self, responder: impl FnMut(&[u8]) -> Reaction + 'static) {
        self.state.borrow_mut().responder = Some(Box::new(responder));
    }

    /// All frames transmitted so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.borrow().sent.clone()
    }

    /// Deliver pending bridge responses and drive the queue until it drains
    /// or `max` real time elapsed (initiation delays are real).
    pub fn run(&self, comm: &mut DaliComm, max: Duration) {
        let deadline = Instant::now() + max;
        loop {
            let pending: Vec<u8> = std::mem::take(&mut self.state.borrow_mut().inbound);
            let progressed = !pending.is_empty();
            if progressed {
                comm.queue_mut().accept_inbound_bytes(&pending);
            }
            comm.process();
            let drained =
                comm.queue_mut().is_empty() && self.state.borrow().inbound.is_empty();
            if drained || Instant::now() >= deadline {
                break;
            }
            if !progressed {
                // only initiation delays or timeouts can move things now
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    pub fn status_probe(&self) -> StatusProbe {
        StatusProbe::default()
    }
}

/// Captures a status callback's single delivery.
#[derive(Clone, Default)]
pub struct StatusProbe {
    slot: Rc<Cell<Option<Result<()>>>>,
}

impl StatusProbe {
    pub fn callback(&self) -> StatusCallback {
        let slot = self.slot.clone();
        Box::new(move |_, res| slot.set(Some(res)))
    }

    pub fn take(&self) -> Option<Result<()>> {
        self.slot.take()
    }
}
