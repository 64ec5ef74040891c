//! # Stream Multiplexer
//!
//! One physical byte stream carrying any number of logs. Every frame names
//! its log by discovery key; the reader task routes it to that log's session
//! and the writer task drains one shared outbound queue.
//!
//! ```text
//!              ┌──────────── reader task ────────────┐
//! stream ─────>│ read_frame → channels[discovery_key] │──> session (log A)
//!              │                                      │──> session (log B)
//!              └──────────────────────────────────────┘
//!              ┌──────────── writer task ────────────┐
//! stream <─────│ write_frame <─ mpsc<Frame>           │<── sessions
//!              └──────────────────────────────────────┘
//! ```
//!
//! Frames for a log the local side has not attached yet are held (up to
//! [`MAX_UNROUTED_FRAMES`] per channel) and delivered on attach, so the two
//! ends may attach their logs in any order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::framing::{read_frame, write_frame, Frame};
use super::messages::Message;
use super::peer::run_session;
use crate::config::OUTBOUND_QUEUE_CAPACITY;
use crate::crypto::Hash;
use crate::log::Log;

/// Frames held per channel nobody has attached to.
pub const MAX_UNROUTED_FRAMES: usize = 64;

/// Channels held for logs nobody has attached to.
const MAX_UNROUTED_CHANNELS: usize = 16;

#[derive(Default)]
struct MuxState {
    channels: HashMap<Hash, mpsc::Sender<Message>>,
    unrouted: HashMap<Hash, VecDeque<Message>>,
    closed: bool,
}

/// A replication stream shared by several logs.
pub struct Mux {
    outbound: mpsc::Sender<Frame>,
    state: Arc<Mutex<MuxState>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Mux {
    /// Take over `stream`. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let state = Arc::new(Mutex::new(MuxState::default()));
        let reader = tokio::spawn(read_loop(read_half, state.clone()));
        let writer = tokio::spawn(write_loop(write_half, outbound_rx));
        Self {
            outbound,
            state,
            reader,
            writer,
        }
    }

    /// Replicate `log` over this stream.
    pub fn attach(&self, log: &Log) {
        let channel = log.discovery_key();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        {
            let mut state = self.state.lock();
            if state.closed {
                debug!(channel = %hex::encode(channel), "stream already closed, not attaching");
                return;
            }
            // Deliver early frames before the reader can route new ones.
            for message in state.unrouted.remove(&channel).unwrap_or_default() {
                let _ = tx.try_send(message);
            }
            state.channels.insert(channel, tx);
        }
        tokio::spawn(run_session(log.shared(), channel, self.outbound.clone(), rx));
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Tear the stream down without waiting for queued frames. Every
    /// attached session sees its inbound queue end.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        let mut state = self.state.lock();
        state.closed = true;
        state.channels.clear();
        state.unrouted.clear();
    }

    /// Wait until the remote closes the stream or it fails.
    pub async fn closed(self) {
        let Mux {
            outbound,
            reader,
            writer,
            ..
        } = self;
        let _ = reader.await;
        drop(outbound);
        let _ = writer.await;
    }
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mux")
            .field("channels", &state.channels.len())
            .field("closed", &state.closed)
            .finish()
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, state: Arc<Mutex<MuxState>>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("replication stream ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, "replication stream failed");
                break;
            }
        };

        let channel = frame.channel;
        let mut message = Some(frame.message);
        let target = {
            let mut state = state.lock();
            match state.channels.get(&channel).cloned() {
                Some(tx) => Some(tx),
                None => {
                    let room = state.unrouted.len() < MAX_UNROUTED_CHANNELS
                        || state.unrouted.contains_key(&channel);
                    match message.take() {
                        Some(early) if room => {
                            let queue = state.unrouted.entry(channel).or_default();
                            if queue.len() < MAX_UNROUTED_FRAMES {
                                queue.push_back(early);
                            }
                        }
                        _ => debug!(channel = %hex::encode(channel), "dropping frame for unattached log"),
                    }
                    None
                }
            }
        };
        if let (Some(tx), Some(message)) = (target, message) {
            if tx.send(message).await.is_err() {
                // The session ended; later frames wait for a new attach.
                state.lock().channels.remove(&channel);
            }
        }
    }

    let mut state = state.lock();
    state.closed = true;
    state.channels.clear();
    state.unrouted.clear();
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut frames: mpsc::Receiver<Frame>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "replication write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
