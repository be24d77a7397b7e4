//! The MFi (also known as MLD) ringtone format.
//!
//! An MFi file is laid out as:
//!
//! ```text
//! "melo" <file length: u32> <track offset: u16> <major: u8> <minor: u8> <track count: u8>
//! <info records: tag(4) size(u16) payload>...   (until the track offset)
//! ("trac" <size: u32> <records>)...              (track count times)
//! ```
//!
//! Records are bit-packed and not self-delimiting: an unknown record code makes the rest of the
//! track unreadable, so it is reported as an `ErrorKind::Unsupported` error.

use crate::{
    chunk::{ChunkLayout, ChunkReader},
    convert::{self, ConvertOptions},
    prelude::*,
    primitive::latin1,
};

/// The signature every MFi file starts with.
pub const MAGIC: &[u8; 4] = b"melo";

/// Bytes from the start of the file up to the first information record.
const HEADER_LEN: usize = 13;

/// Position at which the track offset starts counting, right after its own field.
const TRACK_OFFSET_BASE: usize = 10;

#[cfg(feature = "parallel")]
const PARALLEL_ENABLE_THRESHOLD: usize = 3 * 1024;

/// A decoded MFi file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mfi {
    /// Header and data-information block.
    pub info: MfiInfo,
    pub(crate) tracks: Vec<Vec<MfiEvent>>,
}
impl Mfi {
    /// Decode an MFi file.
    ///
    /// Any error aborts the whole parse.
    pub fn parse(raw: &[u8]) -> Result<Mfi> {
        let mut cursor = raw;
        let signature = cursor
            .split_checked(4)
            .ok_or(err_invalid!("failed to read mfi signature"))?;
        ensure!(signature == MAGIC, err_invalid!("invalid mfi signature"));
        let file_length = u32::read(&mut cursor).context(err_invalid!("truncated mfi header"))?;
        let track_offset = u16::read(&mut cursor).context(err_invalid!("truncated mfi header"))?
            as usize
            + TRACK_OFFSET_BASE;
        let major_type = u8::read(&mut cursor).context(err_invalid!("truncated mfi header"))?;
        let minor_type = u8::read(&mut cursor).context(err_invalid!("truncated mfi header"))?;
        let track_count = u8::read(&mut cursor).context(err_invalid!("truncated mfi header"))?;
        ensure!(
            track_offset >= HEADER_LEN,
            err_invalid!("mfi track offset points inside the header")
        );
        if cfg!(feature = "strict") {
            ensure!(
                file_length as usize + 8 == raw.len(),
                err_malformed!("mfi file length does not match the data")
            );
        }

        let mut info = MfiInfo {
            file_length,
            track_offset,
            major_type,
            minor_type,
            track_count,
            ..MfiInfo::default()
        };
        let info_raw = raw
            .get(HEADER_LEN..track_offset)
            .ok_or(err_invalid!("mfi track offset out of range"))?;
        info.read_records(info_raw)
            .context(err_invalid!("failed to read mfi data information"))?;

        let mut chunks = ChunkReader::new(&raw[track_offset..], ChunkLayout::SMF);
        chunks.parse(Some(track_count as usize))?;
        let mut bodies = Vec::with_capacity(track_count as usize);
        for idx in 0..track_count as usize {
            let chunk = *chunks.get(idx).context(err_invalid!("missing mfi track"))?;
            ensure!(&chunk.id == b"trac", err_invalid!("invalid mfi track signature"));
            bodies.push(chunks.data(&chunk));
        }
        let tracks = decode_tracks(bodies, info.note_flag())?;
        log::debug!(
            "parsed mfi {}.{}: {} tracks, {} records, title {:?}",
            info.major_type,
            info.minor_type,
            tracks.len(),
            tracks.iter().map(Vec::len).sum::<usize>(),
            info.title
        );
        Ok(Mfi { info, tracks })
    }

    /// The amount of tracks in the file.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Translate this file into a Standard Midi File.
    ///
    /// See [`convert::to_smf`](convert/fn.to_smf.html).
    pub fn to_smf(&self, options: &ConvertOptions) -> Result<Vec<u8>> {
        convert::to_smf(self, options)
    }
}

fn decode_tracks(bodies: Vec<&[u8]>, note_flag: bool) -> Result<Vec<Vec<MfiEvent>>> {
    let read = |body: &[u8]| read_track(body, note_flag);
    #[cfg(feature = "parallel")]
    {
        let total: usize = bodies.iter().map(|body| body.len()).sum();
        if total >= PARALLEL_ENABLE_THRESHOLD {
            use rayon::prelude::*;
            return bodies.into_par_iter().map(read).collect();
        }
    }
    bodies.into_iter().map(read).collect()
}

fn read_track(mut raw: &[u8], note_flag: bool) -> Result<Vec<MfiEvent>> {
    let mut events = Vec::with_capacity(raw.len() / 3);
    while !raw.is_empty() {
        events.push(
            MfiEvent::read(&mut raw, note_flag).context(err_invalid!("failed to read mfi record"))?,
        );
    }
    Ok(events)
}

/// The header and data-information block of an MFi file.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MfiInfo {
    /// Length of the file after the length field itself, as declared.
    pub file_length: u32,
    /// Absolute offset of the first track.
    pub track_offset: usize,
    pub major_type: u8,
    pub minor_type: u8,
    /// The amount of tracks, as declared.
    pub track_count: u8,
    /// `titl`
    pub title: Option<String>,
    /// `copy`
    pub copyright: Option<String>,
    /// `vers`
    pub version: Option<String>,
    /// `date`
    pub date: Option<String>,
    /// `prot`
    pub protection: Option<String>,
    /// `sorc`
    pub source: Option<u8>,
    /// `note`: when 1, note records carry an extra velocity and octave shift byte.
    pub note: Option<u16>,
    /// `exst`
    pub extended_status: Option<Vec<u8>>,
    /// Any other record, in file order.
    pub other: Vec<([u8; 4], Vec<u8>)>,
}
impl MfiInfo {
    /// Whether note records carry velocity and octave shift.
    pub fn note_flag(&self) -> bool {
        self.note == Some(1)
    }

    fn read_records(&mut self, raw: &[u8]) -> Result<()> {
        let mut records = ChunkReader::new(raw, ChunkLayout::MFI_INFO);
        records.parse(None)?;
        for record in records.chunks() {
            let data = records.data(record);
            match &record.id {
                b"titl" => self.title = Some(latin1(data)),
                b"copy" => self.copyright = Some(latin1(data)),
                b"vers" => self.version = Some(latin1(data)),
                b"date" => self.date = Some(latin1(data)),
                b"prot" => self.protection = Some(latin1(data)),
                b"sorc" => {
                    self.source = Some(
                        u8::read(&mut &data[..]).context(err_invalid!("empty sorc record"))?,
                    )
                }
                b"note" => {
                    self.note = Some(
                        u16::read(&mut &data[..]).context(err_invalid!("truncated note record"))?,
                    )
                }
                b"exst" => self.extended_status = Some(data.to_vec()),
                _ => self.other.push((record.id, data.to_vec())),
            }
        }
        Ok(())
    }
}

/// A single MFi record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MfiEvent {
    /// Ticks since the previous record.
    pub delta: u8,
    pub kind: MfiEventKind,
}
impl MfiEvent {
    fn read(raw: &mut &[u8], note_flag: bool) -> Result<MfiEvent> {
        let delta = u8::read(raw)?;
        let status = u8::read(raw)?;
        let kind = if status != 0xFF {
            MfiEventKind::Note(Note::read(status, raw, note_flag)?)
        } else {
            let status = u8::read(raw)?;
            let code = status & 0xF;
            match status >> 4 {
                0xB => MfiEventKind::System(SystemMessage::read(code, raw)?),
                0xC => MfiEventKind::Tempo(TempoMessage::read(code, raw)?),
                0xD => MfiEventKind::Control(ControlMessage::read(code, raw)?),
                0xE => {
                    let byte = u8::read(raw)?;
                    MfiEventKind::Instrument {
                        part: u2::from(byte >> 6),
                        message: InstrumentMessage::read(code, byte)?,
                    }
                }
                0xF => MfiEventKind::Extended(ExtendedMessage::read(code, raw)?),
                _ => bail!(err_unsupported!("unknown mfi message class")),
            }
        };
        Ok(MfiEvent { delta, kind })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MfiEventKind {
    Note(Note),
    System(SystemMessage),
    Tempo(TempoMessage),
    Control(ControlMessage),
    Instrument {
        part: u2,
        message: InstrumentMessage,
    },
    Extended(ExtendedMessage),
}

/// A note, with both its start and its length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Note {
    pub voice: u2,
    pub key: u6,
    pub length: u8,
    /// Only present if the file's note flag is set.
    pub velocity: Option<u6>,
    /// Only present if the file's note flag is set.
    pub octave_shift: Option<u2>,
}
impl Note {
    fn read(status: u8, raw: &mut &[u8], note_flag: bool) -> Result<Note> {
        let length = u8::read(raw)?;
        let (velocity, octave_shift) = if note_flag {
            let ext = u8::read(raw)?;
            (Some(u6::from(ext >> 2)), Some(u2::from(ext)))
        } else {
            (None, None)
        };
        Ok(Note {
            voice: u2::from(status >> 6),
            key: u6::from(status),
            length,
            velocity,
            octave_shift,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SystemMessage {
    MasterVolume(u8),
    DrumScale { channel: u8, drum: bool },
}
impl SystemMessage {
    fn read(code: u8, raw: &mut &[u8]) -> Result<SystemMessage> {
        let byte = u8::read(raw)?;
        Ok(match code {
            0x0 => SystemMessage::MasterVolume(byte),
            0xA => SystemMessage::DrumScale {
                channel: bit_range(byte, 3..6),
                drum: bit_range(byte, 0..1) != 0,
            },
            _ => bail!(err_unsupported!("unknown mfi system message")),
        })
    }
}

/// A tempo change, expressed as a time base and a tempo.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct TempoMessage {
    /// Ticks per quarter note, `None` when the file leaves it undefined.
    pub time_base: Option<u16>,
    pub tempo: u8,
}
impl TempoMessage {
    fn read(code: u8, raw: &mut &[u8]) -> Result<TempoMessage> {
        let exp = bit_range(code, 0..3);
        let time_base = if exp == 7 {
            None
        } else {
            let factor = if bit_range(code, 3..4) == 0 { 6 } else { 15 };
            Some((1u16 << exp) * factor)
        };
        Ok(TempoMessage {
            time_base,
            tempo: u8::read(raw)?,
        })
    }

    /// Microseconds per quarter note, as a MIDI tempo meta event would carry.
    ///
    /// `None` if the time base is undefined or the tempo is zero.
    pub fn micros_per_beat(&self) -> Option<u64> {
        let time_base = u64::from(self.time_base?);
        let tempo = u64::from(self.tempo);
        if tempo == 0 {
            None
        } else {
            Some(2_880_000_000 / (tempo * time_base))
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    Point(u8),
    /// A loop boundary. `point` 0 is the start, anything else the end.
    /// `count` 0 loops forever.
    Loop {
        id: u2,
        count: u4,
        point: u2,
    },
    Nop(u8),
    EndOfTrack(u8),
}
impl ControlMessage {
    fn read(code: u8, raw: &mut &[u8]) -> Result<ControlMessage> {
        let byte = u8::read(raw)?;
        Ok(match code {
            0x0 => ControlMessage::Point(byte),
            0xD => ControlMessage::Loop {
                id: u2::from(byte >> 6),
                count: u4::from(byte >> 2),
                point: u2::from(byte),
            },
            0xE => ControlMessage::Nop(byte),
            0xF => ControlMessage::EndOfTrack(byte),
            _ => bail!(err_unsupported!("unknown mfi control message")),
        })
    }
}

/// Per-part instrument settings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum InstrumentMessage {
    /// Bottom 6 bits of the program.
    LowPart(u6),
    /// Top bit of the program, must be followed by a `LowPart`.
    HighPart(u8),
    Volume(u6),
    /// Pan, 32 being the center.
    Valance(u6),
    PitchBend(u6),
    ChannelAssign(u6),
    /// Relative volume change.
    VolumeChange(i8),
    PitchBendRange(u6),
    FineTuning(u6),
    CoarseTuning(u6),
    Modulation(u6),
}
impl InstrumentMessage {
    fn read(code: u8, byte: u8) -> Result<InstrumentMessage> {
        let value = u6::from(byte);
        Ok(match code {
            0x0 => InstrumentMessage::LowPart(value),
            0x1 => InstrumentMessage::HighPart(byte & 0x1),
            0x2 => InstrumentMessage::Volume(value),
            0x3 => InstrumentMessage::Valance(value),
            0x4 => InstrumentMessage::PitchBend(value),
            0x5 => InstrumentMessage::ChannelAssign(value),
            //Sign-extend the 6-bit value
            0x6 => InstrumentMessage::VolumeChange(((value.as_int() << 2) as i8) >> 2),
            0x7 => InstrumentMessage::PitchBendRange(value),
            0x8 => InstrumentMessage::FineTuning(value),
            0x9 => InstrumentMessage::CoarseTuning(value),
            0xA => InstrumentMessage::Modulation(value),
            _ => bail!(err_unsupported!("unknown mfi instrument message")),
        })
    }
}

/// Messages framed by their own 16-bit length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ExtendedMessage {
    EditInstrument(Vec<OperatorSet>),
    Vibrato { part: u2, switch: u2 },
    DeviceSpecific(Vec<u8>),
}
impl ExtendedMessage {
    fn read(code: u8, raw: &mut &[u8]) -> Result<ExtendedMessage> {
        let len = u16::read(raw)?;
        let mut body = raw
            .split_checked(len as usize)
            .ok_or(err_invalid!("truncated mfi extended message"))?;
        Ok(match code {
            0x0 => {
                expect_marker(&mut body, 0x01, err_invalid!("invalid edit instrument constant"))?;
                let mut sets = Vec::with_capacity(body.len() / OperatorSet::LEN);
                while !body.is_empty() {
                    let set = body
                        .split_checked(OperatorSet::LEN)
                        .ok_or(err_invalid!("truncated edit instrument entry"))?;
                    sets.push(OperatorSet::decode(set));
                }
                ExtendedMessage::EditInstrument(sets)
            }
            0x1 => {
                expect_marker(&mut body, 0x01, err_invalid!("invalid vibrato constant"))?;
                let part = u8::read(&mut body)?;
                let switch = u8::read(&mut body)?;
                ExtendedMessage::Vibrato {
                    part: u2::from(part >> 5),
                    switch: u2::from(switch >> 6),
                }
            }
            0xF => {
                expect_marker(&mut body, 0x11, err_invalid!("invalid device specific constant"))?;
                ExtendedMessage::DeviceSpecific(body.to_vec())
            }
            _ => bail!(err_unsupported!("unknown mfi extended message")),
        })
    }
}

/// Extended messages start with a constant byte.
fn expect_marker(raw: &mut &[u8], expected: u8, err: &'static ErrorKind) -> Result<()> {
    let found = u8::read(raw)?;
    ensure!(found == expected, err);
    Ok(())
}

/// The FM voice description of one part.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct OperatorSet {
    pub part: u2,
    pub modulator: Operator,
    pub carrier: Operator,
    pub octave_select: u2,
}
impl OperatorSet {
    const LEN: usize = 10;

    fn decode(raw: &[u8]) -> OperatorSet {
        OperatorSet {
            part: u2::from(raw[0] >> 4),
            modulator: Operator::decode(&raw[1..5]),
            carrier: Operator::decode(&raw[5..9]),
            octave_select: u2::from(raw[9]),
        }
    }
}

/// FM operator parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Operator {
    pub multiple: u8,
    pub vibrato: bool,
    pub envelope: bool,
    pub sustain: bool,
    pub release_rate: u8,
    pub decay_rate: u8,
    pub attack_rate: u8,
    pub sustain_level: u8,
    pub total_level: u8,
    pub waveform: u8,
    pub feedback: u8,
}
impl Operator {
    /// Decodes 4 packed bytes.
    fn decode(raw: &[u8]) -> Operator {
        let (b0, b1, b2, b3) = (raw[0], raw[1], raw[2], raw[3]);
        Operator {
            multiple: b0 >> 5,
            vibrato: bit_range(b0, 4..5) != 0,
            envelope: bit_range(b0, 3..4) != 0,
            sustain: bit_range(b0, 2..3) != 0,
            release_rate: bit_range(b0, 0..2) << 2 | b1 >> 6,
            decay_rate: bit_range(b1, 4..8),
            attack_rate: bit_range(b1, 0..2) << 2 | b2 >> 6,
            sustain_level: bit_range(b2, 4..8),
            total_level: bit_range(b2, 0..2) << 4 | b3 >> 4,
            waveform: bit_range(b3, 3..4),
            feedback: bit_range(b3, 0..3),
        }
    }
}
