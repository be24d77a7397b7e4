//! Timed, loop-aware playback of a merged timeline.
//!
//! Playback is split in two layers:
//!
//! - [`Scheduler`](struct.Scheduler.html) is a pure function from a
//!   [`PlayerState`](struct.PlayerState.html) to the next state, the messages to send right away
//!   and the delay until the next step.
//!   It knows nothing about clocks or sinks, so it can be driven step by step in tests.
//! - [`Player`](struct.Player.html) owns a timeline, a state, a transport and a
//!   [`Sink`](trait.Sink.html).
//!   The host calls `Player::advance` with the current time whenever the previously returned
//!   delay runs out.
//!
//! # Loops
//!
//! Four loop conventions are understood, each one enabled separately through
//! [`LoopConfig`](struct.LoopConfig.html):
//!
//! - Control change 111 marks the loop start, and the end of the timeline jumps back to it.
//! - A marker meta event with text `A` marks the loop start, and a marker with text `B` jumps
//!   back to it.
//! - Markers `LOOP_START=ID:<id>,COUNT:<n>` and `LOOP_END=ID:<id>,COUNT:<n>`, as produced when
//!   converting MFi files, loop `n` times, forever if `n` is negative.
//! - The whole timeline restarts from scratch once it ends.
//!
//! Loop starts are always recorded, the configuration only controls whether jumps happen.
//! The first two conventions share the same loop mark.

use crate::{
    convert::{self, ConvertOptions},
    event::{ChannelMessage, EventKind, MetaMessage, WireMessage},
    merge::{MergedEvent, Timeline},
    mfi::Mfi,
    prelude::*,
    primitive::Timing,
    smf::Smf,
};

/// Microseconds per beat until the first tempo event.
pub const DEFAULT_TEMPO: u32 = 500_000;

/// Bounds the work done by a single `Player::advance` call, since empty loops never wait.
const MAX_CYCLES_PER_ADVANCE: usize = 4096;

/// The controller that marks loop starts.
const LOOP_CONTROLLER: u8 = 111;

/// Which loop conventions trigger jumps.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoopConfig {
    /// Jump back to the last control change 111 when the timeline ends.
    pub cc111: bool,
    /// Jump back to the last `A` marker on a `B` marker.
    pub marker_ab: bool,
    /// Honor `LOOP_END` markers.
    pub mfi_counted: bool,
    /// Restart from the beginning when the timeline ends.
    pub simple: bool,
}

/// Everything that configures a `Player`.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PlayerConfig {
    pub loops: LoopConfig,
    /// Used when loading MFi files.
    pub convert: ConvertOptions,
    /// Playback speed multiplier, 1 being the speed written in the file.
    pub tempo_rate: f64,
}
impl Default for PlayerConfig {
    fn default() -> PlayerConfig {
        PlayerConfig {
            loops: LoopConfig::default(),
            convert: ConvertOptions::default(),
            tempo_rate: 1.0,
        }
    }
}

/// Identifies a loop mark.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoopId {
    /// The mark set by control change 111 and by `A` markers.
    Implicit,
    /// A mark set by a `LOOP_START` marker.
    Mfi(u32),
}

/// How many more times a loop jumps back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LoopCount {
    Infinite,
    Finite(u32),
}

/// A recorded loop start.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoopMark {
    /// Index of the marking event within the timeline.
    pub position: usize,
    pub count: LoopCount,
}

/// Where the playback is within a timeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerState {
    /// Index of the next event to process.
    pub position: usize,
    /// Current tempo, in microseconds per beat.
    pub tempo: u32,
    pub marks: BTreeMap<LoopId, LoopMark>,
}
impl Default for PlayerState {
    fn default() -> PlayerState {
        PlayerState {
            position: 0,
            tempo: DEFAULT_TEMPO,
            marks: BTreeMap::new(),
        }
    }
}

/// What to do after a cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Next {
    /// Step again after this long.
    Wait(Duration),
    /// The timeline is over.
    Finished,
}

/// The outcome of one scheduler step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cycle<'t> {
    pub state: PlayerState,
    /// Messages to send right now, in order.
    pub dispatch: Vec<&'t WireMessage>,
    pub next: Next,
    /// How far behind schedule the next cycle already is when it starts.
    ///
    /// Nonzero when the lateness of this cycle could not be absorbed by its delay, such as
    /// after a loop jump. The next cycle is due `behind` before the `Next::Wait` delay elapses.
    pub behind: Duration,
}

/// A `LOOP_START` or `LOOP_END` marker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct LoopMarker {
    start: bool,
    id: u32,
    count: LoopCount,
}
impl LoopMarker {
    /// Parse `LOOP_(START|END)=ID:<digits>,COUNT:<optional minus><digits>`.
    fn parse(text: &str) -> Option<LoopMarker> {
        fn digits(text: &str) -> Option<u64> {
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some(text.parse::<u64>().unwrap_or(u64::MAX))
        }
        let rest = text.strip_prefix("LOOP_")?;
        let (start, rest) = match rest.strip_prefix("START=ID:") {
            Some(rest) => (true, rest),
            None => (false, rest.strip_prefix("END=ID:")?),
        };
        let (id, count) = rest.split_once(",COUNT:")?;
        let id = u32::try_from(digits(id)?).ok()?;
        let count = match count.strip_prefix('-') {
            Some(neg) => match digits(neg)? {
                0 => LoopCount::Finite(0),
                _ => LoopCount::Infinite,
            },
            None => LoopCount::Finite(u32::try_from(digits(count)?).unwrap_or(u32::MAX)),
        };
        Some(LoopMarker { start, id, count })
    }
}

/// What to do with an event after looking at it.
enum Action {
    Dispatch,
    Jump(usize),
}

/// Computes playback cycles.
///
/// A cycle processes every event sharing the tick of the event at the current position.
/// Every processed event is dispatched except the one that triggers a loop jump, which ends the
/// cycle early with a zero delay.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Scheduler {
    pub loops: LoopConfig,
    /// Playback speed multiplier. Must be positive.
    pub tempo_rate: f64,
}
impl Scheduler {
    pub fn new(loops: LoopConfig, tempo_rate: f64) -> Scheduler {
        Scheduler { loops, tempo_rate }
    }

    /// Run one cycle.
    ///
    /// `late` is how long after its due time this step is running, and is subtracted from the
    /// next delay. Lateness the delay cannot absorb is carried over in `Cycle::behind`.
    pub fn step<'t>(&self, timeline: &'t Timeline, mut state: PlayerState, late: Duration) -> Cycle<'t> {
        let events = timeline.events();
        let mut dispatch = Vec::new();
        let tick = match events.get(state.position) {
            Some(ev) => ev.time,
            None => return self.wrap_around(timeline, state, dispatch, late),
        };
        while let Some(ev) = events.get(state.position).filter(|ev| ev.time == tick) {
            match self.process(ev, &mut state) {
                Action::Dispatch => {
                    dispatch.push(&ev.wire);
                    state.position += 1;
                }
                Action::Jump(target) => {
                    log::trace!("tick {}: loop jump from {} to {}", tick, state.position, target);
                    state.position = target;
                    return Cycle {
                        state,
                        dispatch,
                        next: Next::Wait(Duration::ZERO),
                        behind: late,
                    };
                }
            }
        }
        match events.get(state.position) {
            Some(next) => {
                let span = self.delay(timeline.timing(), state.tempo, next.time - tick);
                let (delay, behind) = absorb(span, late);
                log::trace!(
                    "tick {}: {} messages, next tick {} in {:?}",
                    tick,
                    dispatch.len(),
                    next.time,
                    delay
                );
                Cycle {
                    state,
                    dispatch,
                    next: Next::Wait(delay),
                    behind,
                }
            }
            None => self.wrap_around(timeline, state, dispatch, late),
        }
    }

    /// The time `ticks` ticks take at the given tempo, adjusted by the tempo rate.
    ///
    /// A tempo rate that is not positive and finite counts as 1.
    pub fn delay(&self, timing: Timing, tempo: u32, ticks: u64) -> Duration {
        let span = timing.span(tempo, ticks);
        if self.tempo_rate == 1.0 || !valid_rate(self.tempo_rate) {
            return span;
        }
        let secs = span.as_secs_f64() / self.tempo_rate;
        if secs.is_finite() && secs >= 0.0 && secs < u64::MAX as f64 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::from_secs(u64::MAX)
        }
    }

    /// The delay before the first cycle from the given state.
    pub fn start_delay(&self, timeline: &Timeline, state: &PlayerState) -> Duration {
        let events = timeline.events();
        let ticks = match events.get(state.position) {
            Some(ev) => {
                let prev = match state.position {
                    0 => 0,
                    pos => events[pos - 1].time,
                };
                ev.time.saturating_sub(prev)
            }
            None => 0,
        };
        self.delay(timeline.timing(), state.tempo, ticks)
    }

    fn process(&self, ev: &MergedEvent, state: &mut PlayerState) -> Action {
        let kind = &ev.event.kind;
        if let Some(tempo) = kind.tempo() {
            state.tempo = tempo;
        }
        match kind {
            EventKind::Channel {
                message: ChannelMessage::Controller { controller, .. },
                ..
            } if *controller == LOOP_CONTROLLER => {
                state.marks.insert(LoopId::Implicit, implicit_mark(state.position));
            }
            EventKind::Meta(MetaMessage::Marker(text)) => match text.as_str() {
                "A" => {
                    state.marks.insert(LoopId::Implicit, implicit_mark(state.position));
                }
                "B" => {
                    if self.loops.marker_ab {
                        if let Some(mark) = state.marks.get(&LoopId::Implicit) {
                            return Action::Jump(mark.position);
                        }
                    }
                }
                text => {
                    if let Some(marker) = LoopMarker::parse(text) {
                        return self.mfi_loop(marker, state);
                    }
                }
            },
            _ => {}
        }
        Action::Dispatch
    }

    fn mfi_loop(&self, marker: LoopMarker, state: &mut PlayerState) -> Action {
        let id = LoopId::Mfi(marker.id);
        if marker.start {
            let position = state.position;
            state.marks.entry(id).or_insert(LoopMark {
                position,
                count: marker.count,
            });
            return Action::Dispatch;
        }
        if !self.loops.mfi_counted {
            return Action::Dispatch;
        }
        let jump = match state.marks.get_mut(&id) {
            Some(mark) => match mark.count {
                LoopCount::Infinite => Some(mark.position),
                LoopCount::Finite(0) => None,
                LoopCount::Finite(n) => {
                    mark.count = LoopCount::Finite(n - 1);
                    Some(mark.position)
                }
            },
            None => {
                log::warn!("loop end without a matching loop start (id {})", marker.id);
                return Action::Dispatch;
            }
        };
        match jump {
            Some(position) => Action::Jump(position),
            None => {
                state.marks.remove(&id);
                Action::Dispatch
            }
        }
    }

    /// Decide what happens once the position is past the last event.
    fn wrap_around<'t>(
        &self,
        timeline: &'t Timeline,
        mut state: PlayerState,
        dispatch: Vec<&'t WireMessage>,
        late: Duration,
    ) -> Cycle<'t> {
        let implicit = state.marks.get(&LoopId::Implicit).map(|mark| mark.position);
        let (next, behind) = match implicit {
            Some(position) if self.loops.cc111 => {
                log::trace!("end of timeline, looping back to {}", position);
                state.position = position;
                (Next::Wait(Duration::ZERO), late)
            }
            _ if self.loops.simple && !timeline.is_empty() => {
                log::trace!("end of timeline, restarting");
                state = PlayerState::default();
                let (delay, behind) = absorb(self.start_delay(timeline, &state), late);
                (Next::Wait(delay), behind)
            }
            _ => (Next::Finished, Duration::ZERO),
        };
        Cycle {
            state,
            dispatch,
            next,
            behind,
        }
    }
}

/// Split a delay into what is left to wait and how much lateness remains unabsorbed.
fn absorb(delay: Duration, late: Duration) -> (Duration, Duration) {
    match delay.checked_sub(late) {
        Some(left) => (left, Duration::ZERO),
        None => (Duration::ZERO, late - delay),
    }
}

fn valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

fn after(now: Duration, delay: Duration) -> Duration {
    now.checked_add(delay).unwrap_or(Duration::MAX)
}

fn implicit_mark(position: usize) -> LoopMark {
    LoopMark {
        position,
        count: LoopCount::Infinite,
    }
}

/// Receives the bytes of every message the player sends.
pub trait Sink {
    fn send(&mut self, message: &[u8]);
}
impl<F: FnMut(&[u8])> Sink for F {
    fn send(&mut self, message: &[u8]) {
        self(message)
    }
}
/// Collects every message, mostly useful for testing.
impl Sink for Vec<Vec<u8>> {
    fn send(&mut self, message: &[u8]) {
        self.push(message.to_vec());
    }
}

/// Whether the player is running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    Stopped,
    /// The next cycle runs at `due`.
    Playing { due: Duration },
    /// The next cycle runs `remaining` after resuming.
    Paused { remaining: Duration },
}

/// Drives a `Scheduler` over a loaded timeline, sending messages to a `Sink`.
///
/// All methods taking `now` expect a monotonic time measured from an arbitrary, fixed epoch.
#[derive(Debug)]
pub struct Player<S> {
    config: PlayerConfig,
    sink: Option<S>,
    timeline: Option<Timeline>,
    state: PlayerState,
    transport: Transport,
    master_volume: u14,
}
impl<S: Sink> Player<S> {
    /// A player with nothing loaded and no sink.
    ///
    /// A tempo rate that is not positive and finite is replaced by 1.
    pub fn new(mut config: PlayerConfig) -> Player<S> {
        if !valid_rate(config.tempo_rate) {
            log::warn!("invalid tempo rate {}, using 1", config.tempo_rate);
            config.tempo_rate = 1.0;
        }
        Player {
            config,
            sink: None,
            timeline: None,
            state: PlayerState::default(),
            transport: Transport::Stopped,
            master_volume: u14::max_value(),
        }
    }

    /// Set where messages are sent. The master volume is sent to the new sink right away.
    pub fn set_sink(&mut self, sink: S) {
        self.sink = Some(sink);
        self.send_master_volume();
    }

    pub fn sink(&self) -> Option<&S> {
        self.sink.as_ref()
    }

    pub fn sink_mut(&mut self) -> Option<&mut S> {
        self.sink.as_mut()
    }

    /// Load a Standard Midi File, replacing whatever was loaded.
    ///
    /// If the file fails to parse, the player is left untouched.
    pub fn load_smf(&mut self, raw: &[u8]) -> Result<()> {
        let smf = Smf::parse(raw)?;
        self.install(Timeline::from_smf(smf));
        Ok(())
    }

    /// Load an MFi file, replacing whatever was loaded.
    ///
    /// If the file fails to parse or convert, the player is left untouched.
    pub fn load_mfi(&mut self, raw: &[u8]) -> Result<()> {
        let mfi = Mfi::parse(raw)?;
        let smf = convert::convert(&mfi, &self.config.convert)?;
        self.install(Timeline::from_smf(smf));
        Ok(())
    }

    fn install(&mut self, timeline: Timeline) {
        self.send_panic();
        log::debug!(
            "loaded timeline of {} events, {:?}",
            timeline.len(),
            timeline.timing()
        );
        self.timeline = Some(timeline);
        self.state = PlayerState::default();
        self.transport = Transport::Stopped;
        self.send_init();
    }

    /// Start or resume playback.
    ///
    /// A paused player resumes with the delay it had left when paused.
    /// A player that reached the end restarts from the beginning.
    /// An empty timeline stays stopped.
    pub fn play(&mut self, now: Duration) -> Result<()> {
        ensure!(self.sink.is_some(), err_precondition!("no sink to send messages to"));
        let timeline = self
            .timeline
            .as_ref()
            .ok_or(err_precondition!("no sequence loaded"))?;
        match self.transport {
            Transport::Playing { .. } => {}
            Transport::Paused { remaining } => {
                self.transport = Transport::Playing {
                    due: after(now, remaining),
                };
            }
            Transport::Stopped => {
                if timeline.is_empty() {
                    return Ok(());
                }
                if self.state.position >= timeline.len() {
                    self.state.position = 0;
                }
                let delay = self.scheduler().start_delay(timeline, &self.state);
                self.transport = Transport::Playing {
                    due: after(now, delay),
                };
            }
        }
        Ok(())
    }

    /// Run every cycle that is due at `now`.
    ///
    /// Returns how long until `advance` should be called again, or `None` if the player is not
    /// playing anymore.
    pub fn advance(&mut self, now: Duration) -> Result<Option<Duration>> {
        let scheduler = self.scheduler();
        let mut due = match self.transport {
            Transport::Playing { due } => due,
            _ => return Ok(None),
        };
        let (timeline, sink) = match (self.timeline.as_ref(), self.sink.as_mut()) {
            (Some(timeline), Some(sink)) => (timeline, sink),
            _ => bail!(err_precondition!("player lost its sequence or sink")),
        };
        let mut cycles = 0;
        while due <= now && cycles < MAX_CYCLES_PER_ADVANCE {
            cycles += 1;
            let late = now - due;
            let cycle = scheduler.step(timeline, mem::take(&mut self.state), late);
            for msg in cycle.dispatch.iter() {
                sink.send(msg.as_bytes());
            }
            self.state = cycle.state;
            match cycle.next {
                Next::Wait(delay) => {
                    due = after(now, delay)
                        .checked_sub(cycle.behind)
                        .unwrap_or(Duration::ZERO)
                }
                Next::Finished => {
                    log::debug!("playback finished");
                    self.transport = Transport::Stopped;
                    return Ok(None);
                }
            }
        }
        self.transport = Transport::Playing { due };
        Ok(Some(due.checked_sub(now).unwrap_or(Duration::ZERO)))
    }

    /// Pause playback, keeping the position, loop marks and the time left until the next cycle.
    pub fn pause(&mut self, now: Duration) {
        if let Transport::Playing { due } = self.transport {
            self.transport = Transport::Paused {
                remaining: due.checked_sub(now).unwrap_or(Duration::ZERO),
            };
        }
    }

    /// Pause playback and silence every channel.
    pub fn stop(&mut self, now: Duration) {
        self.pause(now);
        self.send_panic();
    }

    /// Silence every channel, rewind to the beginning and reset every channel's controllers.
    pub fn reset(&mut self) {
        self.send_panic();
        self.state = PlayerState::default();
        self.transport = Transport::Stopped;
        self.send_init();
    }

    /// Set and send the 14-bit master volume.
    pub fn set_master_volume(&mut self, volume: u14) {
        self.master_volume = volume;
        self.send_master_volume();
    }

    /// Set the playback speed multiplier, which must be positive and finite.
    pub fn set_tempo_rate(&mut self, rate: f64) -> Result<()> {
        ensure!(
            valid_rate(rate),
            err_precondition!("tempo rate must be positive")
        );
        self.config.tempo_rate = rate;
        Ok(())
    }

    pub fn set_cc111_loop(&mut self, enable: bool) {
        self.config.loops.cc111 = enable;
    }

    pub fn set_marker_loop(&mut self, enable: bool) {
        self.config.loops.marker_ab = enable;
    }

    pub fn set_mfi_loop(&mut self, enable: bool) {
        self.config.loops.mfi_counted = enable;
    }

    pub fn set_simple_loop(&mut self, enable: bool) {
        self.config.loops.simple = enable;
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn timeline(&self) -> Option<&Timeline> {
        self.timeline.as_ref()
    }

    /// The name of the loaded sequence, if it is a single-track file that has one.
    pub fn sequence_name(&self) -> Option<&str> {
        self.timeline.as_ref().and_then(Timeline::sequence_name)
    }

    pub fn copyrights(&self) -> &[String] {
        match &self.timeline {
            Some(timeline) => timeline.copyrights(),
            None => &[],
        }
    }

    /// Index of the next event to play.
    pub fn position(&self) -> usize {
        self.state.position
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn master_volume(&self) -> u14 {
        self.master_volume
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.config.loops, self.config.tempo_rate)
    }

    fn send(&mut self, message: &[u8]) {
        if let Some(sink) = self.sink.as_mut() {
            sink.send(message);
        }
    }

    /// All notes off on every channel.
    fn send_panic(&mut self) {
        for channel in 0..16 {
            self.send(&[0xB0 | channel, 0x78, 0x00]);
        }
    }

    /// Volume, pan, pitch bend and pitch bend range back to their defaults on every channel.
    fn send_init(&mut self) {
        for channel in 0..16 {
            self.send(&[0xB0 | channel, 0x07, 0x64]);
            self.send(&[0xB0 | channel, 0x0A, 0x40]);
            self.send(&[0xE0 | channel, 0x00, 0x40]);
            self.send(&[0xB0 | channel, 0x64, 0x00]);
            self.send(&[0xB0 | channel, 0x65, 0x00]);
            self.send(&[0xB0 | channel, 0x06, 0x02]);
            self.send(&[0xB0 | channel, 0x26, 0x00]);
        }
    }

    fn send_master_volume(&mut self) {
        let volume = self.master_volume.as_int();
        self.send(&[
            0xF0,
            0x7F,
            0x7F,
            0x04,
            0x01,
            (volume & 0x7F) as u8,
            (volume >> 7) as u8,
            0xF7,
        ]);
    }
}

#[cfg(feature = "std")]
impl<S: Sink> Player<S> {
    /// Play until the timeline finishes, sleeping the current thread between cycles.
    ///
    /// Never returns if a loop is enabled and the file loops.
    pub fn run(&mut self) -> Result<()> {
        let epoch = std::time::Instant::now();
        self.play(epoch.elapsed())?;
        while let Some(wait) = self.advance(epoch.elapsed())? {
            std::thread::sleep(wait);
        }
        Ok(())
    }
}
