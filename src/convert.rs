//! Translation of MFi files into Standard Midi Files.
//!
//! The four MFi tracks of four voices each map onto the sixteen MIDI channels
//! (`channel = track * 4 + voice`), and each channel becomes one track of a format 1 file with
//! 48 ticks per quarter note.
//! Tempo changes, loop markers and master volume always land on the first track.
//!
//! Most MFi parameters are 6 bits wide and are doubled to fill the 7-bit MIDI range.

use crate::{
    event::{ChannelMessage, EventKind, MetaMessage, TrackEvent},
    mfi::{
        ControlMessage, InstrumentMessage, Mfi, MfiEvent, MfiEventKind, Note, SystemMessage, TempoMessage,
    },
    prelude::*,
    primitive::{Format, Timing},
    smf::{self, Header, Smf},
};

/// Ticks per quarter note of converted files.
pub const TICKS_PER_BEAT: u16 = 48;

/// The amount of tracks in a converted file, one per MIDI channel.
pub const CHANNEL_COUNT: usize = 16;

/// MIDI channel used for percussion.
const RHYTHM_CHANNEL: u8 = 9;

/// MFi keys are offset from MIDI keys by this amount.
const KEY_BASE: u8 = 45;

/// How to translate the parts of an MFi file that have no exact MIDI counterpart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConvertOptions {
    /// Lower notes on the rhythm channel (channel 9) by 10 semitones.
    ///
    /// Enabled by default. This is a heuristic observed in real files, not part of the format.
    pub rhythm_key_offset: bool,
    /// The 6-bit velocity given to notes of files that carry no velocity information.
    ///
    /// Only the bottom 6 bits are used.
    pub default_velocity: u8,
}
impl Default for ConvertOptions {
    fn default() -> ConvertOptions {
        ConvertOptions {
            rhythm_key_offset: true,
            default_velocity: 63,
        }
    }
}

/// Convert an MFi file into a Standard Midi File buffer.
///
/// The output is a format 1 file with 16 tracks and 48 ticks per quarter note, and is identical
/// for identical inputs.
pub fn to_smf(mfi: &Mfi, options: &ConvertOptions) -> Result<Vec<u8>> {
    let tracks = translate(mfi, options)?;
    let header = Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(TICKS_PER_BEAT)),
    );
    let mut out = Vec::with_capacity(
        14 + tracks.iter().map(|track| 8 + track.len() * 4).sum::<usize>(),
    );
    smf::write(&header, tracks.iter(), &mut out)?;
    log::debug!(
        "converted mfi into a {} byte smf, {} events",
        out.len(),
        tracks.iter().map(Vec::len).sum::<usize>()
    );
    Ok(out)
}

/// Convert an MFi file and decode the result, as if the converted buffer had been read from a
/// file.
pub fn convert(mfi: &Mfi, options: &ConvertOptions) -> Result<Smf> {
    let raw = to_smf(mfi, options)?;
    Smf::parse(&raw).context(err_invalid!("converted mfi file failed to parse"))
}

/// Map an MFi key through the octave shift table.
///
/// Shifts 0 to 3 are `+0`, `+12`, `-24` and `-12` semitones; anything else is invalid.
pub fn octave_shift(key: u8, shift: u8) -> Result<u8> {
    let offset: i16 = match shift {
        0 => 0,
        1 => 12,
        2 => -24,
        3 => -12,
        _ => bail!(err_invalid!("invalid octave shift value")),
    };
    let shifted = i16::from(key) + offset;
    ensure!(
        (0..=0x7F).contains(&shifted),
        err_invalid!("octave shift moves the key out of range")
    );
    Ok(shifted as u8)
}

/// An MFi record, or a piece of one, placed at an absolute time.
#[derive(Copy, Clone, Debug)]
enum Flat<'a> {
    NoteOn(&'a Note),
    NoteOff(&'a Note),
    ProgramChange { part: u2, program: u7 },
    Record(&'a MfiEventKind),
}

/// Expand notes into note on/off pairs, join program halves and compute absolute times.
///
/// The result is stably sorted by time, so records at the same time keep their file order.
fn flatten(track: &[MfiEvent]) -> Result<Vec<(u64, Flat<'_>)>> {
    let mut flat = Vec::with_capacity(track.len() * 2);
    let mut time = 0u64;
    let mut records = track.iter();
    while let Some(ev) = records.next() {
        time += u64::from(ev.delta);
        match &ev.kind {
            MfiEventKind::Note(note) => {
                flat.push((time, Flat::NoteOn(note)));
                flat.push((time + u64::from(note.length), Flat::NoteOff(note)));
            }
            MfiEventKind::Control(ControlMessage::Nop(_)) => {}
            MfiEventKind::Instrument {
                message: InstrumentMessage::HighPart(high),
                ..
            } => {
                let low = records
                    .next()
                    .ok_or(err_invalid!("broken instrument: missing low part"))?;
                time += u64::from(low.delta);
                match low.kind {
                    MfiEventKind::Instrument {
                        part,
                        message: InstrumentMessage::LowPart(low),
                    } => flat.push((
                        time,
                        Flat::ProgramChange {
                            part,
                            program: u7::from(high << 6 | low.as_int()),
                        },
                    )),
                    _ => bail!(err_invalid!("broken instrument: high part not followed by low part")),
                }
            }
            kind => flat.push((time, Flat::Record(kind))),
        }
    }
    flat.sort_by_key(|(time, _)| *time);
    Ok(flat)
}

/// Per-channel event lists, addressed by absolute time.
struct Channels {
    lists: Vec<Vec<(u64, EventKind)>>,
}
impl Channels {
    fn new() -> Channels {
        Channels {
            lists: (0..CHANNEL_COUNT).map(|_| Vec::new()).collect(),
        }
    }

    fn push(&mut self, channel: u8, time: u64, kind: EventKind) {
        self.lists[channel as usize].push((time, kind));
    }

    fn message(&mut self, channel: u8, time: u64, message: ChannelMessage) {
        self.push(
            channel,
            time,
            EventKind::Channel {
                channel: u4::from(channel),
                message,
            },
        );
    }

    fn controller(&mut self, channel: u8, time: u64, controller: u8, value: u8) {
        self.message(
            channel,
            time,
            ChannelMessage::Controller {
                controller: u7::from(controller),
                value: u7::from(value),
            },
        );
    }

    /// Set a registered parameter: select it with CC 100/101, then write CC 6.
    fn rpn(&mut self, channel: u8, time: u64, param: u8, value: u8) {
        self.controller(channel, time, 0x64, param);
        self.controller(channel, time, 0x65, 0x00);
        self.controller(channel, time, 0x06, value);
    }

    /// Turn absolute times into deltas and close every track.
    fn finish(self) -> Result<Vec<Vec<TrackEvent>>> {
        self.lists
            .into_iter()
            .map(|mut list| {
                //Records from different MFi tracks meet on the first channel
                list.sort_by_key(|(time, _)| *time);
                let mut events = Vec::with_capacity(list.len() + 1);
                let mut last = 0;
                for (time, kind) in list {
                    let delta = u32::try_from(time - last)
                        .ok()
                        .and_then(u28::try_from)
                        .ok_or(err_invalid!("converted delta time exceeds 28 bits"))?;
                    events.push(TrackEvent { delta, time, kind });
                    last = time;
                }
                events.push(TrackEvent {
                    delta: u28::new(0),
                    time: last,
                    kind: EventKind::Meta(MetaMessage::EndOfTrack),
                });
                Ok(events)
            })
            .collect()
    }
}

fn translate(mfi: &Mfi, options: &ConvertOptions) -> Result<Vec<Vec<TrackEvent>>> {
    ensure!(
        mfi.tracks.len() * 4 <= CHANNEL_COUNT,
        err_invalid!("mfi file has more tracks than there are midi channels")
    );
    let mut out = Channels::new();
    if let Some(copyright) = &mfi.info.copyright {
        out.push(
            0,
            0,
            EventKind::Meta(MetaMessage::Copyright(copyright.clone())),
        );
    }
    for (track_idx, track) in mfi.tracks.iter().enumerate() {
        let base = track_idx as u8 * 4;
        for (time, flat) in flatten(track)? {
            match flat {
                Flat::NoteOn(note) | Flat::NoteOff(note) => {
                    let channel = base + note.voice.as_int();
                    let mut key = octave_shift(
                        note.key.as_int() + KEY_BASE,
                        note.octave_shift.map_or(0, u2::as_int),
                    )?;
                    if channel == RHYTHM_CHANNEL && options.rhythm_key_offset {
                        key = key.saturating_sub(10);
                    }
                    let key = u7::from(key);
                    let vel = u7::from(
                        note.velocity
                            .unwrap_or_else(|| u6::from(options.default_velocity))
                            .as_int()
                            * 2,
                    );
                    let message = match flat {
                        Flat::NoteOn(_) => ChannelMessage::NoteOn { key, vel },
                        _ => ChannelMessage::NoteOff { key, vel },
                    };
                    out.message(channel, time, message);
                }
                Flat::ProgramChange { part, program } => {
                    out.message(
                        base + part.as_int(),
                        time,
                        ChannelMessage::ProgramChange { program },
                    );
                }
                Flat::Record(kind) => translate_record(&mut out, base, time, kind),
            }
        }
    }
    out.finish()
}

fn translate_record(out: &mut Channels, base: u8, time: u64, kind: &MfiEventKind) {
    match *kind {
        MfiEventKind::Tempo(tempo) => {
            if let Some(tempo) = tempo_meta(&tempo) {
                out.push(0, time, EventKind::Meta(MetaMessage::Tempo(tempo)));
            }
        }
        MfiEventKind::Control(ControlMessage::Loop { id, count, point }) => {
            let count = if count == 0 {
                -1
            } else {
                i32::from(count.as_int())
            };
            let text = format!(
                "LOOP_{}=ID:{},COUNT:{}",
                if point == 0 { "START" } else { "END" },
                id,
                count
            );
            out.push(0, time, EventKind::Meta(MetaMessage::Marker(text)));
        }
        MfiEventKind::System(SystemMessage::MasterVolume(volume)) => {
            //Universal realtime master volume, with the same value in both halves
            out.push(
                0,
                time,
                EventKind::SysEx(vec![0x7F, 0x7F, 0x04, 0x01, volume, volume]),
            );
        }
        MfiEventKind::Instrument { part, message } => {
            let channel = base + part.as_int();
            match message {
                InstrumentMessage::Volume(v) => out.controller(channel, time, 0x07, v.as_int() * 2),
                InstrumentMessage::Valance(v) => {
                    out.controller(channel, time, 0x0A, v.as_int() * 2)
                }
                InstrumentMessage::Modulation(v) => {
                    out.controller(channel, time, 0x01, v.as_int() * 2)
                }
                InstrumentMessage::PitchBend(v) => {
                    let half = u16::from(v.as_int()) * 2;
                    out.message(
                        channel,
                        time,
                        ChannelMessage::PitchBend {
                            bend: u14::from(half << 7 | half),
                        },
                    );
                }
                InstrumentMessage::PitchBendRange(v) => out.rpn(channel, time, 0x00, v.as_int() * 2),
                InstrumentMessage::FineTuning(v) => out.rpn(channel, time, 0x01, v.as_int() * 2),
                InstrumentMessage::CoarseTuning(v) => out.rpn(channel, time, 0x02, v.as_int() * 2),
                InstrumentMessage::LowPart(_) => {
                    log::warn!("ignoring instrument low part without a high part");
                }
                InstrumentMessage::HighPart(_)
                | InstrumentMessage::ChannelAssign(_)
                | InstrumentMessage::VolumeChange(_) => {}
            }
        }
        MfiEventKind::Note(_)
        | MfiEventKind::System(SystemMessage::DrumScale { .. })
        | MfiEventKind::Control(_)
        | MfiEventKind::Extended(_) => {}
    }
}

/// The tempo meta value for an MFi tempo record, if it has one.
fn tempo_meta(tempo: &TempoMessage) -> Option<u24> {
    match tempo.micros_per_beat() {
        Some(micros) => Some(u32::try_from(micros).ok().and_then(u24::try_from).unwrap_or_else(|| {
            log::warn!("mfi tempo of {} us per beat does not fit, clamping", micros);
            u24::max_value()
        })),
        None => {
            log::warn!("ignoring mfi tempo record with undefined time base or zero tempo");
            None
        }
    }
}
