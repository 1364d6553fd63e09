//! Playback scheduler: gapless sequencing of inbound audio on the output clock.
//!
//! The active handle set and the `next_start` cursor are owned by a single
//! actor task. `enqueue`, `interrupt` and `reset` are messages on one
//! ordered mailbox, so an interrupt either sees an enqueue fully applied or
//! not at all. Natural-end notifications from the device come back on a
//! second channel and only ever remove handles.

use crate::audio::codec::decode_pcm16_base64;
use crate::audio::{HandleId, OutputDevice, ScheduledBuffer};
use crate::error::{LiveError, Result};
use crate::pipeline::messages::{DecodedClip, InboundChunk};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counters reported when the scheduler shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Clips handed to the output device.
    pub scheduled: u64,
    /// Chunks dropped because they could not be decoded.
    pub decode_failures: u64,
    /// Interrupts processed (including the final reset).
    pub interrupts: u64,
}

/// What an interrupt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptReport {
    /// Handles that were stopped.
    pub stopped: usize,
    /// The cursor after the reset; equal to the output clock at that instant.
    pub next_start: Duration,
}

/// One outstanding handle as seen from outside the actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveClip {
    pub id: HandleId,
    pub seq: u64,
    pub start: Duration,
    pub end: Duration,
}

/// Point-in-time view of the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub now: Duration,
    pub next_start: Duration,
    /// Outstanding handles ordered by id (and so by scheduling order).
    pub active: Vec<ActiveClip>,
}

enum SchedulerCommand {
    Enqueue(InboundChunk),
    Interrupt(oneshot::Sender<InterruptReport>),
    Snapshot(oneshot::Sender<PlaybackSnapshot>),
    Reset(oneshot::Sender<PlaybackStats>),
}

/// A scheduled, cancellable unit of output.
struct PlaybackHandle {
    seq: u64,
    start: Duration,
    end: Duration,
    voice: Box<dyn ScheduledBuffer>,
}

struct SchedulerCore {
    output: Arc<dyn OutputDevice>,
    next_start: Duration,
    active: BTreeMap<HandleId, PlaybackHandle>,
    next_id: HandleId,
    ended_tx: mpsc::UnboundedSender<HandleId>,
    stats: PlaybackStats,
}

impl SchedulerCore {
    fn decode(&self, chunk: &InboundChunk) -> Result<DecodedClip> {
        let samples = decode_pcm16_base64(&chunk.payload)?;
        Ok(DecodedClip {
            seq: chunk.seq,
            samples: samples.into(),
            sample_rate: self.output.sample_rate(),
        })
    }

    fn enqueue(&mut self, chunk: InboundChunk) {
        let clip = match self.decode(&chunk) {
            Ok(clip) => clip,
            Err(e) => {
                self.stats.decode_failures += 1;
                warn!(seq = chunk.seq, "dropping undecodable audio chunk: {e}");
                return;
            }
        };

        let now = self.output.now();
        let start = now.max(self.next_start);
        let duration = clip.duration();
        let id = self.next_id;
        self.next_id += 1;

        let voice = match self.output.schedule_buffer(
            id,
            Arc::clone(&clip.samples),
            start,
            self.ended_tx.clone(),
        ) {
            Ok(voice) => voice,
            Err(e) => {
                warn!(seq = clip.seq, "output device refused clip: {e}");
                return;
            }
        };

        self.next_start = start + duration;
        self.stats.scheduled += 1;
        debug!(
            seq = clip.seq,
            id,
            start_ms = start.as_millis() as u64,
            duration_ms = duration.as_millis() as u64,
            "clip scheduled"
        );
        self.active.insert(
            id,
            PlaybackHandle {
                seq: clip.seq,
                start,
                end: start + duration,
                voice,
            },
        );
    }

    fn interrupt(&mut self) -> InterruptReport {
        let stopped = self.active.len();
        for handle in self.active.values() {
            handle.voice.stop();
        }
        self.active.clear();
        self.next_start = self.output.now();
        self.stats.interrupts += 1;
        if stopped > 0 {
            info!(stopped, "playback interrupted");
        }
        InterruptReport {
            stopped,
            next_start: self.next_start,
        }
    }

    fn finished(&mut self, id: HandleId) {
        if let Some(handle) = self.active.remove(&id) {
            debug!(seq = handle.seq, id, "clip finished");
        }
    }

    fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            now: self.output.now(),
            next_start: self.next_start,
            active: self
                .active
                .iter()
                .map(|(&id, h)| ActiveClip {
                    id,
                    seq: h.seq,
                    start: h.start,
                    end: h.end,
                })
                .collect(),
        }
    }
}

async fn run_scheduler(
    mut core: SchedulerCore,
    mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    mut ended: mpsc::UnboundedReceiver<HandleId>,
) -> PlaybackStats {
    loop {
        tokio::select! {
            biased;
            cmd = commands.recv() => {
                // Apply natural ends first so commands see an up-to-date set.
                while let Ok(id) = ended.try_recv() {
                    core.finished(id);
                }
                match cmd {
                    Some(SchedulerCommand::Enqueue(chunk)) => core.enqueue(chunk),
                    Some(SchedulerCommand::Interrupt(reply)) => {
                        let _ = reply.send(core.interrupt());
                    }
                    Some(SchedulerCommand::Snapshot(reply)) => {
                        let _ = reply.send(core.snapshot());
                    }
                    Some(SchedulerCommand::Reset(reply)) => {
                        core.interrupt();
                        commands.close();
                        let _ = reply.send(core.stats);
                        break;
                    }
                    None => {
                        core.interrupt();
                        break;
                    }
                }
            }
            Some(id) = ended.recv() => core.finished(id),
        }
    }
    info!(
        scheduled = core.stats.scheduled,
        decode_failures = core.stats.decode_failures,
        "playback scheduler stopped"
    );
    core.stats
}

/// Cheap, cloneable access to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Queue a chunk for playback. Never suspends.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::SessionClosed`] after the scheduler has been reset.
    pub fn enqueue(&self, chunk: InboundChunk) -> Result<()> {
        self.tx
            .send(SchedulerCommand::Enqueue(chunk))
            .map_err(|_| LiveError::SessionClosed)
    }

    /// Stop everything scheduled or playing and reset the cursor to now.
    ///
    /// Returns after the actor has applied the interrupt.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::SessionClosed`] after the scheduler has been reset.
    pub async fn interrupt(&self) -> Result<InterruptReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Interrupt(reply))
            .map_err(|_| LiveError::SessionClosed)?;
        rx.await.map_err(|_| LiveError::SessionClosed)
    }

    /// Read the current state. Also acts as a barrier: every command sent
    /// before it has been applied when it returns.
    ///
    /// # Errors
    ///
    /// Returns [`LiveError::SessionClosed`] after the scheduler has been reset.
    pub async fn snapshot(&self) -> Result<PlaybackSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Snapshot(reply))
            .map_err(|_| LiveError::SessionClosed)?;
        rx.await.map_err(|_| LiveError::SessionClosed)
    }
}

/// Owner of the scheduler actor for one session.
pub struct PlaybackScheduler {
    handle: SchedulerHandle,
    task: JoinHandle<PlaybackStats>,
}

impl PlaybackScheduler {
    /// Start the actor against `output`. The cursor starts at `output.now()`.
    pub fn spawn(output: Arc<dyn OutputDevice>) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let core = SchedulerCore {
            next_start: output.now(),
            output,
            active: BTreeMap::new(),
            next_id: 0,
            ended_tx,
            stats: PlaybackStats::default(),
        };
        let task = tokio::spawn(run_scheduler(core, commands, ended_rx));
        Self {
            handle: SchedulerHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Interrupt, then stop accepting work. Waits for the actor to exit.
    pub async fn reset(self) -> PlaybackStats {
        let (reply, rx) = oneshot::channel();
        if self.handle.tx.send(SchedulerCommand::Reset(reply)).is_err() {
            warn!("playback scheduler already stopped");
        }
        let stats = rx.await.ok();
        match self.task.await {
            Ok(final_stats) => stats.unwrap_or(final_stats),
            Err(e) => {
                warn!("playback scheduler task failed: {e}");
                stats.unwrap_or_default()
            }
        }
    }
}
