// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::fmt;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error as ThisError;
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tokio::sync::mpsc;
use tracing::{debug, error, info, span, warn, Level, Span};

use crate::midi;
use crate::session::{
    EventStream, MidiEvent, Mode, Session, SystemMode, TrackSummary, TransportState,
};
use crate::smf;
use crate::store::Store;

/// Priority requested for the emission thread.
const EMISSION_THREAD_PRIORITY: u8 = 70;

/// Depth of the bounded capture queue between the device callback and the
/// recorder. Emission never waits on this queue.
const CAPTURE_QUEUE_DEPTH: usize = 256;

/// An operation that isn't legal in the current transport state.
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum TransportError {
    #[error("not legal while the transport is running, stop first")]
    Busy,
    #[error("super looper mode is not enabled")]
    SuperLooperDisabled,
}

/// Where the super looper fixed duration comes from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DurationSource {
    /// An explicit duration.
    Manual(Duration),
    /// The first recording completed in super looper mode sets the duration;
    /// until then no truncation applies.
    FirstTrack,
}

/// A point-in-time report of the looper state.
#[derive(Clone, Debug)]
pub struct Status {
    pub mode: Mode,
    pub system_mode: SystemMode,
    pub transport: TransportState,
    pub selected: usize,
    pub fixed_duration: Option<Duration>,
    /// Whether the most recent take hit the super looper boundary.
    pub last_take_truncated: bool,
    pub tracks: Vec<TrackSummary>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Mode: {} / {}  Transport: {:?}  Selected: {}",
            self.mode, self.system_mode, self.transport, self.selected
        )?;
        if let Some(fixed) = self.fixed_duration {
            writeln!(f, "Fixed loop duration: {:.3}s", fixed.as_secs_f64())?;
        }
        if self.last_take_truncated {
            writeln!(f, "Last take was truncated at the loop boundary.")?;
        }
        for track in &self.tracks {
            writeln!(
                f,
                "  Track {:2} (ch {:2}): {:4} events, {:.3}s{}",
                track.index,
                track.channel,
                track.event_count,
                track.duration.as_secs_f64(),
                match track.program {
                    Some(program) => format!(", program {}", program),
                    None => String::new(),
                },
            )?;
        }
        Ok(())
    }
}

/// The in-progress recording stream. Fed by the capture task, drained by the
/// transition handler that finishes the recording.
struct Capture {
    active: AtomicBool,
    truncated: AtomicBool,
    state: Mutex<CaptureState>,
}

struct CaptureState {
    started: Option<Instant>,
    limit: Option<Duration>,
    channel: u8,
    events: EventStream,
}

impl Capture {
    fn new() -> Capture {
        Capture {
            active: AtomicBool::new(false),
            truncated: AtomicBool::new(false),
            state: Mutex::new(CaptureState {
                started: None,
                limit: None,
                channel: 0,
                events: EventStream::new(),
            }),
        }
    }

    /// Starts a fresh capture stream for the given channel. The recording
    /// clock starts now.
    fn arm(&self, channel: u8, limit: Option<Duration>) {
        let mut state = self.state.lock();
        state.started = Some(Instant::now());
        state.limit = limit;
        state.channel = channel;
        state.events = EventStream::new();
        self.truncated.store(false, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    fn disarm(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Appends a raw device message, timestamped against the recording clock.
    fn push(&self, raw: &[u8]) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state.lock();
        let started = match state.started {
            Some(started) => started,
            None => return,
        };
        let offset = started.elapsed();

        if let Some(limit) = state.limit {
            if offset > limit {
                // Past the fixed loop boundary; the emission loop is about to
                // stop this take.
                self.truncated.store(true, Ordering::Release);
                return;
            }
        }

        let channel = state.channel;
        let event = MidiEvent::from_raw(offset, raw, channel);
        state.events.append(event);
    }

    /// Takes the captured stream, ending the capture.
    fn take(&self) -> (EventStream, bool) {
        self.active.store(false, Ordering::Release);
        let mut state = self.state.lock();
        state.started = None;
        (
            mem::take(&mut state.events),
            self.truncated.load(Ordering::Acquire),
        )
    }

    fn was_truncated(&self) -> bool {
        self.truncated.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct EngineFlags {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

/// A running emission thread.
struct Engine {
    join: JoinHandle<()>,
    flags: Arc<EngineFlags>,
}

/// A playback position within one track's looped event stream.
struct TrackCursor {
    events: Vec<MidiEvent>,
    /// The loop length; zero means play once and stop.
    duration: Duration,
    index: usize,
    cycle: u32,
    done: bool,
}

impl TrackCursor {
    fn new(events: Vec<MidiEvent>, duration: Duration) -> TrackCursor {
        let done = events.is_empty();
        TrackCursor {
            events,
            duration,
            index: 0,
            cycle: 0,
            done,
        }
    }

    /// The absolute time at which the next event is due, with the track's
    /// loop phase resolved.
    fn next_due(&self) -> Option<Duration> {
        if self.done {
            return None;
        }
        Some(self.duration * self.cycle + self.events[self.index].offset)
    }

    fn current(&self) -> &MidiEvent {
        &self.events[self.index]
    }

    /// Moves to the next event, wrapping past the loop boundary.
    fn advance(&mut self) {
        self.index += 1;
        if self.index == self.events.len() {
            self.index = 0;
            if self.duration.is_zero() {
                self.done = true;
            } else {
                self.cycle += 1;
            }
        }
    }
}

struct Inner {
    device: Arc<dyn midi::Device>,
    store: Store,
    export_dir: PathBuf,
    codec: smf::Codec,
    tick: Duration,
    session: Mutex<Session>,
    capture: Capture,
    engine: Mutex<Option<Engine>>,
    span: Span,
}

/// The loop engine: owns the session, the transport state machine, the
/// realtime emission loop and the capture path. All transport mutations go
/// through here. Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct Looper {
    inner: Arc<Inner>,
}

impl Looper {
    /// Creates a looper, restoring the normal mode session from its snapshot
    /// and starting the capture task. Must be called within a tokio runtime.
    pub fn new(
        device: Arc<dyn midi::Device>,
        store: Store,
        export_dir: PathBuf,
        tick: Duration,
        ppqn: u16,
    ) -> Result<Looper, Box<dyn Error>> {
        let session = store.load_or_default(Mode::Normal);

        let inner = Arc::new(Inner {
            device,
            store,
            export_dir,
            codec: smf::Codec::new(ppqn),
            tick,
            session: Mutex::new(session),
            capture: Capture::new(),
            engine: Mutex::new(None),
            span: span!(Level::INFO, "looper"),
        });

        let (events_tx, mut events_rx) = mpsc::channel::<Vec<u8>>(CAPTURE_QUEUE_DEPTH);
        inner.device.watch_events(events_tx)?;
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(raw) = events_rx.recv().await {
                    inner.capture.push(&raw);
                }
            });
        }

        Ok(Looper { inner })
    }

    /// Flips between REC and PLAY. Legal only while stopped.
    pub fn toggle_mode(&self) -> Result<SystemMode, TransportError> {
        let _enter = self.inner.span.enter();

        let mut session = self.inner.session.lock();
        if session.transport() != TransportState::Stopped {
            return Err(TransportError::Busy);
        }

        let system_mode = session.toggle_system_mode();
        info!(mode = %system_mode, "System mode toggled.");
        self.inner.persist(&session);
        Ok(system_mode)
    }

    /// Starts recording or playback when stopped, stops otherwise.
    pub fn start_stop(&self) -> Result<TransportState, TransportError> {
        let _enter = self.inner.span.enter();

        let transport = self.inner.session.lock().transport();
        match transport {
            TransportState::Stopped => self.inner.start(),
            _ => self.inner.stop(),
        }
    }

    /// Navigate left while stopped; pause/resume while playing.
    pub fn nav_left(&self) -> Result<TransportState, TransportError> {
        let _enter = self.inner.span.enter();

        let mut session = self.inner.session.lock();
        match session.transport() {
            TransportState::Stopped => {
                let selected = session.select_prev();
                info!(track = selected, "Selected track.");
                self.inner.persist(&session);
                Ok(TransportState::Stopped)
            }
            TransportState::Playing => {
                self.inner.set_paused(true);
                session.set_transport(TransportState::Paused);
                info!("Playback paused.");
                Ok(TransportState::Paused)
            }
            TransportState::Paused => {
                self.inner.set_paused(false);
                session.set_transport(TransportState::Playing);
                info!("Playback resumed.");
                Ok(TransportState::Playing)
            }
            TransportState::Recording(_) => Err(TransportError::Busy),
        }
    }

    /// Navigate right while stopped; clear the selected track while playing.
    pub fn nav_right(&self) -> Result<TransportState, TransportError> {
        let _enter = self.inner.span.enter();

        let mut session = self.inner.session.lock();
        match session.transport() {
            TransportState::Stopped => {
                let selected = session.select_next();
                info!(track = selected, "Selected track.");
                self.inner.persist(&session);
                Ok(TransportState::Stopped)
            }
            state @ (TransportState::Playing | TransportState::Paused) => {
                let selected = session.selected();
                session.track_mut(selected).clear();
                info!(track = selected, "Track cleared.");
                self.inner.persist(&session);
                Ok(state)
            }
            TransportState::Recording(_) => Err(TransportError::Busy),
        }
    }

    /// Forces the transport to stopped and clears all ten tracks of the
    /// current mode's session. The other mode's snapshot is untouched.
    pub fn delete_all(&self) {
        let _enter = self.inner.span.enter();

        self.inner.stop_engine();
        self.inner.capture.disarm();

        let mut session = self.inner.session.lock();
        if let Err(e) = midi::panic(self.inner.device.as_ref()) {
            error!(err = e.to_string(), "Error sending MIDI panic.");
        }
        session.clear_all();
        session.set_transport(TransportState::Stopped);
        self.inner.persist(&session);
        info!("All tracks deleted.");
    }

    /// Switches between the normal and super looper sessions. The outgoing
    /// session is persisted under its own snapshot key first, so the two
    /// modes' data never cross-contaminate.
    pub fn set_super_looper(
        &self,
        enabled: bool,
        source: Option<DurationSource>,
    ) -> Result<(), TransportError> {
        let _enter = self.inner.span.enter();

        let mut session = self.inner.session.lock();
        if session.transport() != TransportState::Stopped {
            return Err(TransportError::Busy);
        }

        let target = if enabled {
            Mode::SuperLooper
        } else {
            Mode::Normal
        };

        if session.mode() != target {
            self.inner.persist(&session);
            *session = self.inner.store.load_or_default(target);
            info!(mode = %target, "Switched session mode.");
        }

        if enabled {
            match source {
                Some(DurationSource::Manual(duration)) => {
                    session.set_fixed_duration(Some(duration));
                    info!(duration = ?duration, "Fixed loop duration set.");
                }
                Some(DurationSource::FirstTrack) => {
                    session.set_fixed_duration(None);
                    info!("Fixed loop duration will be taken from the first recording.");
                }
                None => {}
            }
        }

        self.inner.persist(&session);
        Ok(())
    }

    /// Changes the super looper loop length. Only changes the loop-wrap
    /// denominator; recorded event offsets are untouched.
    pub fn set_fixed_duration(&self, duration: Duration) -> Result<(), TransportError> {
        let _enter = self.inner.span.enter();

        let mut session = self.inner.session.lock();
        if matches!(session.transport(), TransportState::Recording(_)) {
            return Err(TransportError::Busy);
        }
        if session.mode() != Mode::SuperLooper {
            return Err(TransportError::SuperLooperDisabled);
        }

        session.set_fixed_duration(Some(duration));
        info!(duration = ?duration, "Fixed loop duration set.");
        self.inner.persist(&session);
        Ok(())
    }

    /// Reports the current looper state.
    pub fn status(&self) -> Status {
        let session = self.inner.session.lock();
        Status {
            mode: session.mode(),
            system_mode: session.system_mode(),
            transport: session.transport(),
            selected: session.selected(),
            fixed_duration: session.fixed_duration(),
            last_take_truncated: self.inner.capture.was_truncated(),
            tracks: session.summaries(),
        }
    }

    /// Exports the session as Standard MIDI Files: one merged file, or one
    /// file per non-empty track. Only legal while stopped.
    pub fn export(&self, merge: bool) -> Result<Vec<PathBuf>, Box<dyn Error>> {
        let _enter = self.inner.span.enter();

        let session = self.inner.session.lock();
        if session.transport() != TransportState::Stopped {
            return Err(Box::new(TransportError::Busy));
        }

        std::fs::create_dir_all(&self.inner.export_dir)?;
        let paths = if merge {
            vec![self
                .inner
                .codec
                .export_merged(&session, &self.inner.export_dir)?]
        } else {
            self.inner
                .codec
                .export_separate(&session, &self.inner.export_dir)?
        };
        Ok(paths)
    }

    /// Imports a Standard MIDI File into the given track, replacing its
    /// content. Only legal while stopped; a decode failure leaves the session
    /// untouched.
    pub fn import(&self, track: usize, path: &Path) -> Result<(), Box<dyn Error>> {
        let _enter = self.inner.span.enter();

        let mut session = self.inner.session.lock();
        if session.transport() != TransportState::Stopped {
            return Err(Box::new(TransportError::Busy));
        }

        let channel = session.track(track).channel();
        let stream = self.inner.codec.import(path, channel)?;
        let events = stream.len();
        session.track_mut(track).record_overwrite(stream);
        self.inner.persist(&session);
        info!(track, events, path = %path.display(), "Imported SMF into track.");
        Ok(())
    }

    /// Stops any running transport activity. Used at shutdown.
    pub fn shutdown(&self) {
        let _enter = self.inner.span.enter();

        if self.inner.session.lock().transport() != TransportState::Stopped {
            if let Err(e) = self.inner.stop() {
                error!(err = e.to_string(), "Error stopping transport.");
            }
        }
        self.inner.device.stop_watch_events();
    }
}

impl Inner {
    /// Begins recording (system mode REC) or playback (PLAY) from stopped.
    fn start(self: &Arc<Inner>) -> Result<TransportState, TransportError> {
        // Reap a finished emission thread, e.g. after a super looper
        // auto-stop.
        self.stop_engine();

        let mut session = self.session.lock();
        let (cursors, record_limit, state) = match session.system_mode() {
            SystemMode::Rec => {
                let selected = session.selected();
                let limit = match (session.mode(), session.fixed_duration()) {
                    (Mode::SuperLooper, Some(fixed)) => Some(fixed),
                    _ => None,
                };
                self.capture
                    .arm(session.track(selected).channel(), limit);

                let cursors = Inner::build_cursors(&session, Some(selected));
                session.set_transport(TransportState::Recording(selected));
                info!(
                    track = selected,
                    backing_tracks = cursors.len(),
                    limit = ?limit,
                    "Recording started."
                );
                (cursors, limit, TransportState::Recording(selected))
            }
            SystemMode::Play => {
                let cursors = Inner::build_cursors(&session, None);
                if cursors.is_empty() {
                    warn!("No recorded tracks, playing silence.");
                }
                session.set_transport(TransportState::Playing);
                info!(tracks = cursors.len(), "Playback started.");
                (cursors, None, TransportState::Playing)
            }
        };
        drop(session);

        let flags = Arc::new(EngineFlags::default());
        let join = {
            let inner = self.clone();
            let flags = flags.clone();
            thread::spawn(move || Inner::run_emission(inner, flags, cursors, record_limit))
        };
        *self.engine.lock() = Some(Engine { join, flags });

        Ok(state)
    }

    /// Stops recording or playback: cancel the emission loop, panic, flush a
    /// recording, persist.
    fn stop(&self) -> Result<TransportState, TransportError> {
        self.stop_engine();

        let mut session = self.session.lock();
        match session.transport() {
            TransportState::Recording(track) => {
                self.finish_recording(&mut session, track);
            }
            TransportState::Playing | TransportState::Paused => {
                if let Err(e) = midi::panic(self.device.as_ref()) {
                    error!(err = e.to_string(), "Error sending MIDI panic.");
                }
                session.set_transport(TransportState::Stopped);
                info!("Playback stopped.");
            }
            // The super looper boundary stopped the take before we got here.
            TransportState::Stopped => {}
        }
        Ok(TransportState::Stopped)
    }

    /// Flushes the captured stream into the given track and persists. The
    /// panic is sent before the new state is observable.
    fn finish_recording(&self, session: &mut Session, track: usize) {
        if let Err(e) = midi::panic(self.device.as_ref()) {
            error!(err = e.to_string(), "Error sending MIDI panic.");
        }

        let (stream, truncated) = self.capture.take();
        let limit = match (session.mode(), session.fixed_duration()) {
            (Mode::SuperLooper, Some(fixed)) => Some(fixed),
            _ => None,
        };
        let stream = match limit {
            Some(limit) => EventStream::from_events(
                stream
                    .iter()
                    .filter(|event| event.offset <= limit)
                    .cloned()
                    .collect(),
            ),
            None => stream,
        };
        if truncated {
            warn!(
                track,
                "Recording reached the fixed loop duration, later events were discarded."
            );
        }

        let duration = stream.duration();
        if session.mode() == Mode::SuperLooper
            && session.fixed_duration().is_none()
            && !stream.is_empty()
        {
            session.set_fixed_duration(Some(duration));
            info!(duration = ?duration, "First take set the fixed loop duration.");
        }

        session.track_mut(track).record_overwrite(stream);
        session.set_transport(TransportState::Stopped);
        self.persist(session);
        info!(track, duration = ?duration, "Recording finished.");
    }

    /// Called by the emission thread when the recording clock reaches the
    /// super looper boundary.
    fn auto_stop(&self, track: usize) {
        warn!(track, "Super looper boundary reached, stopping the take.");
        self.capture.disarm();
        let mut session = self.session.lock();
        self.finish_recording(&mut session, track);
    }

    /// Cancels and joins the emission thread if one is running. Cancellation
    /// takes effect within one scheduler tick.
    fn stop_engine(&self) {
        if let Some(engine) = self.engine.lock().take() {
            engine.flags.cancelled.store(true, Ordering::Release);
            if engine.join.join().is_err() {
                error!("Error joining emission thread.");
            }
        }
    }

    fn set_paused(&self, paused: bool) {
        if let Some(engine) = self.engine.lock().as_ref() {
            engine.flags.paused.store(paused, Ordering::Release);
        }
    }

    fn persist(&self, session: &Session) {
        if let Err(e) = self.store.save(session) {
            error!(err = e.to_string(), "Error persisting session snapshot.");
        }
    }

    /// Builds playback cursors for all non-empty tracks, skipping the track
    /// being recorded. Events past the effective duration (possible after an
    /// import into a super looper session) are skipped.
    fn build_cursors(session: &Session, skip: Option<usize>) -> Vec<TrackCursor> {
        session
            .tracks()
            .filter(|(index, track)| Some(*index) != skip && !track.is_empty())
            .map(|(index, track)| {
                let duration = session.effective_duration(index);
                let events: Vec<MidiEvent> = track
                    .events()
                    .iter()
                    .filter(|event| duration.is_zero() || event.offset <= duration)
                    .cloned()
                    .collect();
                TrackCursor::new(events, duration)
            })
            .collect()
    }

    /// The emission loop. Runs on its own realtime-priority thread; its only
    /// blocking operation is sleeping until the next scheduled tick.
    fn run_emission(
        inner: Arc<Inner>,
        flags: Arc<EngineFlags>,
        mut cursors: Vec<TrackCursor>,
        record_limit: Option<Duration>,
    ) {
        let span = span!(Level::INFO, "emission");
        let _enter = span.enter();

        if let Ok(priority) = ThreadPriorityValue::try_from(EMISSION_THREAD_PRIORITY) {
            if set_current_thread_priority(ThreadPriority::Crossplatform(priority)).is_err() {
                debug!("Unable to raise emission thread priority.");
            }
        }

        let tick = inner.tick;
        let start = Instant::now();
        let mut next_tick = start;
        let mut paused_total = Duration::ZERO;
        let mut pause_started: Option<Instant> = None;

        loop {
            if flags.cancelled.load(Ordering::Acquire) {
                return;
            }

            if flags.paused.load(Ordering::Acquire) {
                if pause_started.is_none() {
                    pause_started = Some(Instant::now());
                    if let Err(e) = midi::panic(inner.device.as_ref()) {
                        error!(err = e.to_string(), "Error sending MIDI panic.");
                    }
                }
                thread::sleep(Duration::from_millis(5));
                next_tick = Instant::now();
                continue;
            }
            if let Some(pause) = pause_started.take() {
                paused_total += pause.elapsed();
            }

            let elapsed = start.elapsed().saturating_sub(paused_total);

            if let Some(limit) = record_limit {
                if elapsed >= limit {
                    let track = match inner.session.lock().transport() {
                        TransportState::Recording(track) => Some(track),
                        _ => None,
                    };
                    if let Some(track) = track {
                        inner.auto_stop(track);
                    }
                    return;
                }
            }

            for cursor in cursors.iter_mut() {
                while let Some(due) = cursor.next_due() {
                    if due > elapsed {
                        break;
                    }
                    if let Err(e) = inner.device.send(&cursor.current().data) {
                        error!(err = e.to_string(), "Error sending MIDI message.");
                    }
                    cursor.advance();
                }
            }

            next_tick += tick;
            let now = Instant::now();
            if next_tick > now {
                spin_sleep::sleep(next_tick - now);
            } else {
                // We overran; realign rather than bursting to catch up.
                next_tick = now;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::midi::test::Device as MockDevice;
    use crate::testutil::eventually;

    use super::*;

    struct Fixture {
        device: MockDevice,
        looper: Looper,
        _dir: tempfile::TempDir,
    }

    fn fixture(name: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = MockDevice::get(name);
        let looper = Looper::new(
            Arc::new(device.clone()),
            Store::new(dir.path().join("data")),
            dir.path().join("exports"),
            Duration::from_millis(1),
            480,
        )
        .expect("unable to create looper");
        Fixture {
            device,
            looper,
            _dir: dir,
        }
    }

    fn note_on(offset: Duration, key: u8, channel: u8) -> MidiEvent {
        MidiEvent::from_raw(offset, &[0x90 | channel, key, 100], channel)
    }

    #[test]
    fn test_cursor_phase_alignment() {
        // A one-event track with a 4s loop and another with a 10s loop: by
        // t=9s the first has wrapped twice and the third emission of both
        // lands together on the tick where their loops phase-align.
        let mut short = TrackCursor::new(
            vec![note_on(Duration::from_secs(1), 60, 0)],
            Duration::from_secs(4),
        );
        let mut long = TrackCursor::new(
            vec![note_on(Duration::from_secs(9), 62, 1)],
            Duration::from_secs(10),
        );

        let horizon = Duration::from_secs(9);
        let mut short_emissions = Vec::new();
        while let Some(due) = short.next_due() {
            if due > horizon {
                break;
            }
            short_emissions.push(due);
            short.advance();
        }
        let mut long_emissions = Vec::new();
        while let Some(due) = long.next_due() {
            if due > horizon {
                break;
            }
            long_emissions.push(due);
            long.advance();
        }

        assert_eq!(
            short_emissions,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(9)
            ]
        );
        assert_eq!(long_emissions, vec![Duration::from_secs(9)]);
    }

    #[test]
    fn test_cursor_zero_duration_plays_once() {
        let mut cursor = TrackCursor::new(vec![note_on(Duration::ZERO, 60, 0)], Duration::ZERO);

        assert_eq!(cursor.next_due(), Some(Duration::ZERO));
        cursor.advance();
        assert_eq!(cursor.next_due(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_then_playback() {
        let fixture = fixture("mock-record-playback");
        let looper = &fixture.looper;

        assert_eq!(looper.status().transport, TransportState::Stopped);
        assert_eq!(
            looper.start_stop().expect("start"),
            TransportState::Recording(1)
        );

        // Input arrives on channel 3 but lands on track 1's channel 0.
        fixture.device.mock_event(&[0x93, 60, 100]);
        thread::sleep(Duration::from_millis(100));
        fixture.device.mock_event(&[0x83, 60, 0]);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(looper.start_stop().expect("stop"), TransportState::Stopped);
        let status = looper.status();
        assert_eq!(status.tracks[0].event_count, 2);
        assert_eq!(status.tracks[0].channel, 0);
        assert!(status.tracks[0].duration >= Duration::from_millis(100));

        assert_eq!(looper.toggle_mode().expect("toggle"), SystemMode::Play);
        fixture.device.clear_sent();
        assert_eq!(looper.start_stop().expect("play"), TransportState::Playing);

        // The recorded events come back on the track channel, and the loop
        // wraps: the note on shows up again and again.
        let device = fixture.device.clone();
        eventually(
            move || {
                device
                    .sent()
                    .iter()
                    .filter(|message| *message == &vec![0x90, 60, 100])
                    .count()
                    >= 3
            },
            "recorded note never looped back",
        );

        assert_eq!(looper.start_stop().expect("stop"), TransportState::Stopped);
        let sent = fixture.device.sent();
        assert_eq!(sent.last().expect("messages"), &vec![0xBF, 121, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_navigation_and_pause() {
        let fixture = fixture("mock-navigation");
        let looper = &fixture.looper;

        looper.nav_left().expect("nav");
        assert_eq!(looper.status().selected, 10);
        looper.nav_right().expect("nav");
        assert_eq!(looper.status().selected, 1);
        looper.nav_right().expect("nav");
        assert_eq!(looper.status().selected, 2);

        looper.toggle_mode().expect("toggle");
        looper.start_stop().expect("play");

        assert_eq!(looper.nav_left().expect("pause"), TransportState::Paused);
        // The emission loop panics the device on its way into the pause.
        let device = fixture.device.clone();
        eventually(
            move || device.sent().last() == Some(&vec![0xBF, 121, 0]),
            "pause never sent a panic",
        );
        assert_eq!(looper.nav_left().expect("resume"), TransportState::Playing);

        // Clear-selected keeps the transport running.
        assert_eq!(looper.nav_right().expect("clear"), TransportState::Playing);
        assert_eq!(looper.status().transport, TransportState::Playing);

        looper.start_stop().expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_illegal_transitions_while_recording() {
        let fixture = fixture("mock-illegal");
        let looper = &fixture.looper;

        looper.start_stop().expect("start");
        assert_eq!(looper.nav_left(), Err(TransportError::Busy));
        assert_eq!(looper.nav_right(), Err(TransportError::Busy));
        assert_eq!(looper.toggle_mode(), Err(TransportError::Busy));
        assert_eq!(
            looper.set_super_looper(true, None),
            Err(TransportError::Busy)
        );
        // The failed calls left the recording running.
        assert_eq!(looper.status().transport, TransportState::Recording(1));
        looper.start_stop().expect("stop");

        assert_eq!(
            looper.set_fixed_duration(Duration::from_secs(4)),
            Err(TransportError::SuperLooperDisabled)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_super_looper_auto_stop() {
        let fixture = fixture("mock-auto-stop");
        let looper = &fixture.looper;

        looper
            .set_super_looper(
                true,
                Some(DurationSource::Manual(Duration::from_millis(200))),
            )
            .expect("super looper");
        let status = looper.status();
        assert_eq!(status.mode, Mode::SuperLooper);
        assert_eq!(status.fixed_duration, Some(Duration::from_millis(200)));

        looper.start_stop().expect("start");
        fixture.device.mock_event(&[0x90, 64, 80]);

        // The recording stops itself at the loop boundary.
        let probe = looper.clone();
        eventually(
            move || probe.status().transport == TransportState::Stopped,
            "recording never auto-stopped at the boundary",
        );

        let status = looper.status();
        assert_eq!(status.tracks[0].event_count, 1);
        assert!(status.tracks[0].duration <= Duration::from_millis(200));

        // The transport is usable again after the auto-stop.
        assert_eq!(
            looper.start_stop().expect("restart"),
            TransportState::Recording(1)
        );
        looper.start_stop().expect("stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_take_sets_fixed_duration() {
        let fixture = fixture("mock-first-take");
        let looper = &fixture.looper;

        looper
            .set_super_looper(true, Some(DurationSource::FirstTrack))
            .expect("super looper");
        assert_eq!(looper.status().fixed_duration, None);

        looper.start_stop().expect("start");
        fixture.device.mock_event(&[0x90, 60, 100]);
        thread::sleep(Duration::from_millis(80));
        fixture.device.mock_event(&[0x80, 60, 0]);
        thread::sleep(Duration::from_millis(50));
        looper.start_stop().expect("stop");

        let status = looper.status();
        let fixed = status.fixed_duration.expect("expected a fixed duration");
        assert_eq!(fixed, status.tracks[0].duration);
        assert!(fixed >= Duration::from_millis(80));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mode_switch_keeps_sessions_isolated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path().join("data"));

        let mut normal = Session::new(Mode::Normal);
        normal.track_mut(3).record_overwrite(EventStream::from_events(vec![note_on(
            Duration::from_millis(10),
            60,
            2,
        )]));
        store.save(&normal).expect("save");

        let device = MockDevice::get("mock-isolation");
        let looper = Looper::new(
            Arc::new(device.clone()),
            store,
            dir.path().join("exports"),
            Duration::from_millis(1),
            480,
        )
        .expect("unable to create looper");
        assert_eq!(looper.status().tracks[2].event_count, 1);

        // The super looper session starts empty, and deleting everything in
        // it leaves the normal session untouched.
        looper
            .set_super_looper(true, Some(DurationSource::Manual(Duration::from_secs(2))))
            .expect("super looper");
        assert_eq!(looper.status().mode, Mode::SuperLooper);
        assert_eq!(looper.status().tracks[2].event_count, 0);
        looper.delete_all();

        looper.set_super_looper(false, None).expect("normal");
        let status = looper.status();
        assert_eq!(status.mode, Mode::Normal);
        assert_eq!(status.tracks[2].event_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_export_and_import() {
        let fixture = fixture("mock-export");
        let looper = &fixture.looper;

        looper.start_stop().expect("start");
        fixture.device.mock_event(&[0x90, 60, 100]);
        thread::sleep(Duration::from_millis(100));
        looper.start_stop().expect("stop");

        let paths = looper.export(false).expect("separate export");
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("track_1.mid"));
        let merged = looper.export(true).expect("merged export");
        assert!(merged[0].ends_with(smf::MERGED_FILE));

        looper.import(4, &paths[0]).expect("import");
        let status = looper.status();
        assert_eq!(status.tracks[3].event_count, 1);
        assert_eq!(status.tracks[3].channel, 3);

        // Neither operation is legal while the transport runs.
        looper.toggle_mode().expect("toggle");
        looper.start_stop().expect("play");
        assert!(looper.export(true).is_err());
        assert!(looper.import(4, &paths[0]).is_err());
        looper.start_stop().expect("stop");
    }
}
