//! Sequenced application messages.
//!
//! Sequences are independent FIFOs keyed by name. Within a sequence every
//! message carries a progressive and the server guarantees in-order delivery
//! to the Metadata Adapter, or reports `MSGFAIL` for the first undelivered
//! one; the client then re-sends from the failed progressive until `MSGDONE`
//! arrives or the per-message delay timeout expires, at which point the
//! message is abandoned with exactly one `on_discarded` and the pipeline
//! advances.
//!
//! The reserved `UNORDERED_MESSAGES` sequence bypasses ordering: messages go
//! out immediately, with per-message acks when a listener is attached and
//! fire-and-forget otherwise.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::client::listener::MessageListener;
use crate::scheduler::{EventDispatcher, TimerPayload, Timers};
use crate::session::RequestChannel;

/// The sequence name that disables ordering.
pub(crate) const UNORDERED_SEQUENCE: &str = "UNORDERED_MESSAGES";

/// Server codes after which a message must not be retried.
const CODE_DISCARDED: i32 = 38;
const CODE_TIMEOUT: i32 = 39;

/// A message handed over by the façade.
pub(crate) struct OutgoingMessage {
    pub text: String,
    pub sequence: String,
    pub delay_timeout: Option<Duration>,
    pub listener: Option<Arc<dyn MessageListener>>,
    pub enqueue_while_disconnected: bool,
}

struct MsgEntry {
    text: String,
    listener: Option<Arc<dyn MessageListener>>,
    delay_timeout: Option<Duration>,
    enqueue: bool,
    sent: bool,
}

#[derive(Default)]
struct SequenceState {
    next_prog: u64,
    entries: BTreeMap<u64, MsgEntry>,
}

/// Message pipeline, owned by the session thread.
pub(crate) struct MessageManager {
    sequences: HashMap<String, SequenceState>,
}

impl MessageManager {
    pub(crate) fn new() -> Self {
        Self {
            sequences: HashMap::new(),
        }
    }

    /// Accept a message from the application.
    ///
    /// `disconnected` reflects the observable status; `chan` is present when
    /// a session is receiving and requests can flow.
    pub(crate) fn submit(
        &mut self,
        message: OutgoingMessage,
        disconnected: bool,
        chan: Option<&mut RequestChannel<'_>>,
        timers: &mut Timers,
        dispatcher: &EventDispatcher,
    ) {
        if disconnected && !message.enqueue_while_disconnected {
            abort_message(message.listener.as_ref(), &message.text, false, dispatcher);
            return;
        }

        // Fire-and-forget: no progressive, no bookkeeping.
        if message.sequence == UNORDERED_SEQUENCE && message.listener.is_none() {
            if let Some(chan) = chan {
                chan.send_message(UNORDERED_SEQUENCE, None, None, false, message.text);
            }
            // Without a session the unordered fire-and-forget path drops the
            // message silently; there is no listener to tell.
            return;
        }

        let sequence = self.sequences.entry(message.sequence.clone()).or_default();
        sequence.next_prog += 1;
        let prog = sequence.next_prog;
        let entry = MsgEntry {
            text: message.text,
            listener: message.listener,
            delay_timeout: message.delay_timeout,
            enqueue: message.enqueue_while_disconnected,
            sent: false,
        };
        if let Some(delay) = entry.delay_timeout {
            timers.schedule(
                delay,
                TimerPayload::MessageTimeout {
                    sequence: message.sequence.clone(),
                    prog,
                },
            );
        }
        sequence.entries.insert(prog, entry);

        if let Some(chan) = chan {
            send_entry(&message.sequence, prog, sequence.entries.get_mut(&prog), chan);
        }
    }

    /// A session became receiving: flush everything still awaiting an
    /// outcome, in progressive order per sequence.
    pub(crate) fn on_session_start(&mut self, chan: &mut RequestChannel<'_>) {
        for (name, sequence) in &mut self.sequences {
            let progs: Vec<u64> = sequence.entries.keys().copied().collect();
            for prog in progs {
                send_entry(name, prog, sequence.entries.get_mut(&prog), chan);
            }
        }
    }

    /// The server processed a message.
    pub(crate) fn on_msgdone(&mut self, sequence: &str, prog: u64, dispatcher: &EventDispatcher) {
        if let Some(entry) = self.remove(sequence, prog) {
            if let Some(listener) = entry.listener {
                let text = entry.text;
                dispatcher.dispatch(move || listener.on_processed(&text));
            }
        }
    }

    /// The server reported a message failure.
    ///
    /// Timeout codes discard the message; negative codes are adapter
    /// denials; anything else is treated as transient and re-sent, together
    /// with the later progressives the server is still holding.
    pub(crate) fn on_msgfail(
        &mut self,
        sequence: &str,
        prog: u64,
        code: i32,
        server_message: &str,
        chan: Option<&mut RequestChannel<'_>>,
        dispatcher: &EventDispatcher,
    ) {
        if code == CODE_DISCARDED || code == CODE_TIMEOUT {
            if let Some(entry) = self.remove(sequence, prog) {
                if let Some(listener) = entry.listener {
                    let text = entry.text;
                    dispatcher.dispatch(move || listener.on_discarded(&text));
                }
            }
            return;
        }
        if code < 0 {
            if let Some(entry) = self.remove(sequence, prog) {
                if let Some(listener) = entry.listener {
                    let text = entry.text;
                    let server_message = server_message.to_string();
                    dispatcher.dispatch(move || listener.on_deny(&text, code, &server_message));
                }
            }
            return;
        }

        tracing::debug!(sequence, prog, code, "message failed, re-sending");
        if let Some(chan) = chan {
            self.resend_from(sequence, prog, chan);
        }
    }

    /// `REQERR` for a message request: outcome unknown.
    pub(crate) fn on_request_error(
        &mut self,
        sequence: &str,
        prog: Option<u64>,
        dispatcher: &EventDispatcher,
    ) {
        let Some(prog) = prog else { return };
        if let Some(entry) = self.remove(sequence, prog) {
            if let Some(listener) = entry.listener {
                let text = entry.text;
                dispatcher.dispatch(move || listener.on_error(&text));
            }
        }
    }

    /// A per-message delay timeout fired. Discards at most once; a message
    /// already resolved is left alone.
    pub(crate) fn on_timeout(&mut self, sequence: &str, prog: u64, dispatcher: &EventDispatcher) {
        if let Some(entry) = self.remove(sequence, prog) {
            tracing::debug!(sequence, prog, "message delay timeout, discarding");
            if let Some(listener) = entry.listener {
                let text = entry.text;
                dispatcher.dispatch(move || listener.on_discarded(&text));
            }
        }
    }

    /// The client disconnected: abort pending messages unless they asked to
    /// be queued across disconnections.
    pub(crate) fn on_disconnect(&mut self, dispatcher: &EventDispatcher) {
        for sequence in self.sequences.values_mut() {
            let doomed: Vec<u64> = sequence
                .entries
                .iter()
                .filter(|(_, e)| !e.enqueue)
                .map(|(prog, _)| *prog)
                .collect();
            for prog in doomed {
                if let Some(entry) = sequence.entries.remove(&prog) {
                    abort_message(entry.listener.as_ref(), &entry.text, entry.sent, dispatcher);
                }
            }
            for entry in sequence.entries.values_mut() {
                entry.sent = false;
            }
        }
    }

    fn resend_from(&mut self, sequence_name: &str, prog: u64, chan: &mut RequestChannel<'_>) {
        let Some(sequence) = self.sequences.get_mut(sequence_name) else {
            return;
        };
        let progs: Vec<u64> = sequence
            .entries
            .range(prog..)
            .map(|(prog, _)| *prog)
            .collect();
        for prog in progs {
            send_entry(sequence_name, prog, sequence.entries.get_mut(&prog), chan);
        }
    }

    fn remove(&mut self, sequence: &str, prog: u64) -> Option<MsgEntry> {
        self.sequences.get_mut(sequence)?.entries.remove(&prog)
    }
}

fn send_entry(
    sequence: &str,
    prog: u64,
    entry: Option<&mut MsgEntry>,
    chan: &mut RequestChannel<'_>,
) {
    let Some(entry) = entry else { return };
    let ordered = sequence != UNORDERED_SEQUENCE;
    let timeout = entry.delay_timeout.and_then(|d| u64::try_from(d.as_millis()).ok());
    chan.send_message(
        sequence,
        Some(prog),
        if ordered { timeout } else { None },
        true,
        entry.text.clone(),
    );
    entry.sent = true;
}

fn abort_message(
    listener: Option<&Arc<dyn MessageListener>>,
    text: &str,
    sent: bool,
    dispatcher: &EventDispatcher,
) {
    if let Some(listener) = listener {
        let listener = Arc::clone(listener);
        let text = text.to_string();
        dispatcher.dispatch(move || listener.on_abort(&text, sent));
    }
}
