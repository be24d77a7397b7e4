//! All sort of events and their parsers.

use crate::{
    prelude::*,
    primitive::{latin1, read_varlen_slice, text_bytes, write_varlen_slice},
};

/// Represents a parsed SMF track event.
///
/// Consists of a delta time (in MIDI ticks relative to the previous event), the absolute time
/// within the track and the actual event.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct TrackEvent {
    /// How many MIDI ticks after the previous event should this event fire.
    pub delta: u28,
    /// How many MIDI ticks after the start of the track should this event fire.
    ///
    /// This is the running sum of all deltas up to and including this event, so it never
    /// decreases within a track.
    pub time: u64,
    /// The type of event along with event-specific data.
    pub kind: EventKind,
}
impl TrackEvent {
    /// Advances the slice and updates `running_status`.
    ///
    /// `time` is the absolute time of the previous event in the track.
    /// In case of failure the slice might be left in the middle of an event!
    pub(crate) fn read(
        raw: &mut &[u8],
        running_status: &mut Option<u8>,
        time: u64,
    ) -> Result<(TrackEvent, WireMessage)> {
        let delta = u28::read_varlen(raw).context(err_invalid!("failed to read event deltatime"))?;
        let (kind, wire) = EventKind::read(raw, running_status)?;
        let ev = TrackEvent {
            delta,
            time: time + u64::from(delta.as_int()),
            kind,
        };
        Ok((ev, wire))
    }

    pub(crate) fn write(&self, running_status: &mut Option<u8>, out: &mut Vec<u8>) -> Result<()> {
        self.delta.write_varlen(out);
        self.kind.write(running_status, out)
    }
}

/// Represents the different kinds of SMF events and their associated data.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub enum EventKind {
    /// A message associated to a MIDI channel carrying musical data.
    Channel {
        /// The MIDI channel that this event is associated with.
        channel: u4,
        /// The MIDI message type and associated data.
        message: ChannelMessage,
    },
    /// A System Exclusive message.
    ///
    /// The payload includes neither the `0xF0` prefix nor the `0xF7` terminator.
    SysEx(Vec<u8>),
    /// An escape sequence, arbitrary bytes to send to the synthesizer as-is.
    Escape(Vec<u8>),
    /// A meta-message, giving extra information for correct playback, like tempo, song name,
    /// lyrics, etc...
    Meta(MetaMessage),
}
impl EventKind {
    fn read(raw: &mut &[u8], running_status: &mut Option<u8>) -> Result<(EventKind, WireMessage)> {
        //Read status
        let mut status = *raw.get(0).ok_or(err_invalid!("failed to read status"))?;
        if status < 0x80 {
            //Running status, the status byte is reused and this byte is the first data byte
            status = running_status.ok_or(err_invalid!(
                "event missing status with no running status active"
            ))?;
        } else {
            *raw = &raw[1..];
        }
        let kind = match status {
            0x80..=0xEF => {
                *running_status = Some(status);
                return ChannelMessage::read(status, raw);
            }
            0xFF => {
                cancel_running_status(running_status);
                let start = *raw;
                let meta = MetaMessage::read(raw).context(err_invalid!("failed to read meta event"))?;
                let consumed = &start[..start.len() - raw.len()];
                let mut wire = Vec::with_capacity(1 + consumed.len());
                wire.push(0xFF);
                wire.extend_from_slice(consumed);
                return Ok((EventKind::Meta(meta), WireMessage(wire)));
            }
            0xF0 => {
                cancel_running_status(running_status);
                let data =
                    read_varlen_slice(raw).context(err_invalid!("failed to read sysex event"))?;
                match data.split_last() {
                    Some((&0xF7, payload)) => EventKind::SysEx(payload.to_vec()),
                    _ => bail!(err_invalid!("sysex event missing its 0xF7 terminator")),
                }
            }
            0xF7 => {
                cancel_running_status(running_status);
                let data =
                    read_varlen_slice(raw).context(err_invalid!("failed to read escape event"))?;
                EventKind::Escape(data.to_vec())
            }
            0xF1..=0xF6 => bail!(err_invalid!(
                "standard midi files cannot contain system common events"
            )),
            0xF8..=0xFE => bail!(err_invalid!(
                "standard midi files cannot contain system realtime events"
            )),
            0x00..=0x7F => bail!(err_invalid!("running status without top bit set")),
        };
        let wire = kind.wire();
        Ok((kind, wire))
    }

    /// Writes a single event to the given output buffer.
    ///
    /// `running_status` keeps track of the last MIDI status, in order to make proper use of
    /// running status. It should be shared between consecutive calls, and should initially be set
    /// to `None`.
    fn write(&self, running_status: &mut Option<u8>, out: &mut Vec<u8>) -> Result<()> {
        //Running Status rules:
        // - MIDI Messages (0x80 ..= 0xEF) alter and use running status
        // - System Exclusive (0xF0) cancels and cannot use running status
        // - Escape (0xF7) cancels and cannot use running status
        // - Meta Messages (0xFF) cancel and cannot use running status
        match self {
            EventKind::Channel { channel, message } => {
                let status = message.status_nibble() << 4 | channel.as_int();
                if Some(status) != *running_status {
                    out.push(status);
                    *running_status = Some(status);
                }
                message.write_data(out);
            }
            EventKind::SysEx(payload) => {
                *running_status = None;
                out.push(0xF0);
                let len = u32::try_from(payload.len() + 1)
                    .ok()
                    .and_then(u28::try_from)
                    .ok_or(err_invalid!("sysex payload exceeds 28 bits"))?;
                len.write_varlen(out);
                out.extend_from_slice(payload);
                out.push(0xF7);
            }
            EventKind::Escape(data) => {
                *running_status = None;
                out.push(0xF7);
                write_varlen_slice(data, out)?;
            }
            EventKind::Meta(meta) => {
                *running_status = None;
                out.push(0xFF);
                meta.write(out)?;
            }
        }
        Ok(())
    }

    /// The bytes a MIDI receiver expects for this event.
    ///
    /// Channel messages are written with their status byte, SysEx messages are framed by
    /// `0xF0`/`0xF7`, escapes are sent verbatim and meta messages keep their SMF framing.
    pub fn wire(&self) -> WireMessage {
        let mut out = Vec::new();
        match self {
            EventKind::Channel { channel, message } => {
                out.push(message.status_nibble() << 4 | channel.as_int());
                message.write_data(&mut out);
            }
            EventKind::SysEx(payload) => {
                out.reserve(payload.len() + 2);
                out.push(0xF0);
                out.extend_from_slice(payload);
                out.push(0xF7);
            }
            EventKind::Escape(data) => out.extend_from_slice(data),
            EventKind::Meta(meta) => {
                out.push(0xFF);
                //Only payloads over 256MB fail to encode, and those never come out of a parser
                let _ = meta.write(&mut out);
            }
        }
        WireMessage(out)
    }

    /// The tempo carried by this event, in microseconds per beat.
    pub fn tempo(&self) -> Option<u32> {
        match self {
            EventKind::Meta(MetaMessage::Tempo(tempo)) => Some(tempo.as_int()),
            _ => None,
        }
    }

    /// The text of a marker meta event.
    pub fn marker(&self) -> Option<&str> {
        match self {
            EventKind::Meta(MetaMessage::Marker(text)) => Some(text),
            _ => None,
        }
    }
}

/// Meta and SysEx events interrupt running status in compliant files.
///
/// Some files keep relying on the last channel status across them, so it is only cancelled
/// in strict mode.
fn cancel_running_status(running_status: &mut Option<u8>) {
    if cfg!(feature = "strict") {
        *running_status = None;
    }
}

/// Data bytes must have their top bit clear.
fn data_byte(byte: u8) -> Result<u7> {
    if cfg!(feature = "strict") {
        Ok(u7::try_from(byte).ok_or(err_malformed!("data byte with top bit set"))?)
    } else {
        Ok(u7::from(byte))
    }
}

/// Represents a MIDI message associated to a MIDI channel.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum ChannelMessage {
    /// Stop playing a note.
    NoteOff {
        /// The MIDI key to stop playing.
        key: u7,
        /// The velocity with which to stop playing it.
        vel: u7,
    },
    /// Start playing a note.
    ///
    /// Decoded messages never have a velocity of 0, those are read as `NoteOff`.
    NoteOn {
        /// The key to start playing.
        key: u7,
        /// The velocity (strength) with which to press it.
        vel: u7,
    },
    /// Modify the velocity of a note after it has been played.
    Aftertouch {
        /// The key for which to modify its velocity.
        key: u7,
        /// The new velocity for the key.
        vel: u7,
    },
    /// Modify the value of a MIDI controller.
    Controller {
        /// The controller to modify.
        controller: u7,
        /// The value to set it to.
        value: u7,
    },
    /// Change the program (also known as instrument) for a channel.
    ProgramChange {
        /// The new program (instrument) to use for the channel.
        program: u7,
    },
    /// Change the note velocity of a whole channel at once, without starting new notes.
    ChannelAftertouch {
        /// The new velocity for all notes currently playing in the channel.
        vel: u7,
    },
    /// Set the pitch bend value for the entire channel.
    ///
    /// `0x2000` is the center, no bend.
    PitchBend {
        /// The new pitch-bend value.
        bend: u14,
    },
}
impl ChannelMessage {
    /// Midi messages have a known length.
    pub(crate) fn msg_length(status: u8) -> usize {
        const LENGTH_BY_STATUS: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 2, 2, 2, 2, 1, 1, 2, 0];
        LENGTH_BY_STATUS[(status >> 4) as usize] as usize
    }

    /// Read the data bytes of a channel message whose status is already known.
    fn read(status: u8, raw: &mut &[u8]) -> Result<(EventKind, WireMessage)> {
        let len = Self::msg_length(status);
        let data = raw
            .split_checked(len)
            .ok_or(err_invalid!("truncated midi message"))?;
        let d0 = data_byte(data[0])?;
        let d1 = if len == 2 { data_byte(data[1])? } else { u7::new(0) };
        let channel = u4::from(status);
        let message = match status >> 4 {
            0x8 => ChannelMessage::NoteOff { key: d0, vel: d1 },
            0x9 if d1 == 0 => {
                //Velocity 0 note-ons are note-offs, and are sent as such
                let message = ChannelMessage::NoteOff { key: d0, vel: d1 };
                let wire = WireMessage(vec![0x80 | channel.as_int(), d0.as_int(), 0]);
                return Ok((EventKind::Channel { channel, message }, wire));
            }
            0x9 => ChannelMessage::NoteOn { key: d0, vel: d1 },
            0xA => ChannelMessage::Aftertouch { key: d0, vel: d1 },
            0xB => ChannelMessage::Controller {
                controller: d0,
                value: d1,
            },
            0xC => ChannelMessage::ProgramChange { program: d0 },
            0xD => ChannelMessage::ChannelAftertouch { vel: d0 },
            0xE => {
                //Note the little-endian order, contrasting with the default big-endian order of
                //Standard Midi Files
                let lsb = d0.as_int() as u16;
                let msb = d1.as_int() as u16;
                ChannelMessage::PitchBend {
                    bend: u14::from(msb << 7 | lsb),
                }
            }
            _ => bail!(err_invalid!("status is not a channel message")),
        };
        let mut wire = Vec::with_capacity(1 + len);
        wire.push(status);
        wire.extend_from_slice(data);
        Ok((EventKind::Channel { channel, message }, WireMessage(wire)))
    }

    /// Get the raw status nibble for this MIDI message type.
    pub(crate) fn status_nibble(&self) -> u8 {
        match self {
            ChannelMessage::NoteOff { .. } => 0x8,
            ChannelMessage::NoteOn { .. } => 0x9,
            ChannelMessage::Aftertouch { .. } => 0xA,
            ChannelMessage::Controller { .. } => 0xB,
            ChannelMessage::ProgramChange { .. } => 0xC,
            ChannelMessage::ChannelAftertouch { .. } => 0xD,
            ChannelMessage::PitchBend { .. } => 0xE,
        }
    }

    /// Write the data part of this message, not including the status.
    fn write_data(&self, out: &mut Vec<u8>) {
        match *self {
            ChannelMessage::NoteOff { key, vel }
            | ChannelMessage::NoteOn { key, vel }
            | ChannelMessage::Aftertouch { key, vel } => {
                out.extend_from_slice(&[key.as_int(), vel.as_int()])
            }
            ChannelMessage::Controller { controller, value } => {
                out.extend_from_slice(&[controller.as_int(), value.as_int()])
            }
            ChannelMessage::ProgramChange { program } => out.push(program.as_int()),
            ChannelMessage::ChannelAftertouch { vel } => out.push(vel.as_int()),
            ChannelMessage::PitchBend { bend } => {
                let raw = bend.as_int();
                out.extend_from_slice(&[(raw & 0x7F) as u8, (raw >> 7) as u8])
            }
        }
    }
}

/// A "meta message", as defined by the SMF spec.
/// These events carry metadata about the track, such as tempo, time signature, copyright, etc...
///
/// Text is decoded one character per byte.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub enum MetaMessage {
    /// The number of a sequence. An empty payload is read as `None`.
    SequenceNumber(Option<u16>),
    /// Arbitrary text associated to an instant.
    Text(String),
    /// A copyright notice.
    Copyright(String),
    /// The name of the track, or of the whole sequence when it is the first track.
    TrackName(String),
    /// Information about the name of the current instrument.
    InstrumentName(String),
    /// Arbitrary lyric information associated to an instant.
    Lyric(String),
    /// Arbitrary marker text associated to an instant.
    ///
    /// Loop points are usually described by markers.
    Marker(String),
    /// Arbitrary cue point text associated to an instant.
    CuePoint(String),
    /// Information about the name of the current program.
    ProgramName(String),
    /// Name of the device that this file was intended to be played with.
    DeviceName(String),
    /// The channel that the following meta and sysex events refer to.
    ChannelPrefix(u4),
    /// Number of the MIDI port that this file was intended to be played with.
    MidiPort(u7),
    /// Obligatory at track end.
    EndOfTrack,
    /// Amount of microseconds per beat (quarter note).
    Tempo(u24),
    /// The raw hour, minute, second, frame and subframe bytes of the track start offset.
    SmpteOffset([u8; 5]),
    /// In order of the MIDI specification, numerator, denominator, MIDI clocks per click, 32nd
    /// notes per quarter
    TimeSignature(u8, u8, u8, u8),
    /// As in the MIDI specification, negative numbers indicate number of flats and positive
    /// numbers indicate number of sharps.
    /// `false` indicates a major scale, `true` indicates a minor scale.
    KeySignature(i8, bool),
    /// Arbitrary data intended for the sequencer.
    SequencerSpecific(Vec<u8>),
    /// An unknown meta-message, kept as-is.
    ///
    /// The first `u8` is the raw meta-message identifier byte.
    Unknown(u8, Vec<u8>),
}
impl MetaMessage {
    fn read(raw: &mut &[u8]) -> Result<MetaMessage> {
        let type_byte = u8::read(raw).context(err_invalid!("failed to read meta message type"))?;
        let mut data =
            read_varlen_slice(raw).context(err_invalid!("failed to read meta message data"))?;
        let expect = |data: &[u8], len: usize| -> Result<()> {
            ensure!(data.len() >= len, err_invalid!("meta message payload too short"));
            if cfg!(feature = "strict") {
                ensure!(data.len() == len, err_malformed!("meta message payload too long"));
            }
            Ok(())
        };
        Ok(match type_byte {
            0x00 => MetaMessage::SequenceNumber(if data.is_empty() {
                None
            } else {
                expect(data, 2)?;
                Some(u16::read(&mut data)?)
            }),
            0x01 => MetaMessage::Text(latin1(data)),
            0x02 => MetaMessage::Copyright(latin1(data)),
            0x03 => MetaMessage::TrackName(latin1(data)),
            0x04 => MetaMessage::InstrumentName(latin1(data)),
            0x05 => MetaMessage::Lyric(latin1(data)),
            0x06 => MetaMessage::Marker(latin1(data)),
            0x07 => MetaMessage::CuePoint(latin1(data)),
            0x08 => MetaMessage::ProgramName(latin1(data)),
            0x09 => MetaMessage::DeviceName(latin1(data)),
            0x20 => {
                expect(data, 1)?;
                MetaMessage::ChannelPrefix(u4::from(data[0]))
            }
            0x21 => {
                expect(data, 1)?;
                MetaMessage::MidiPort(u7::from(data[0]))
            }
            0x2F => {
                expect(data, 0)?;
                MetaMessage::EndOfTrack
            }
            0x51 => {
                expect(data, 3)?;
                MetaMessage::Tempo(u24::read(&mut data)?)
            }
            0x54 => {
                expect(data, 5)?;
                let mut smpte = [0; 5];
                smpte.copy_from_slice(&data[..5]);
                MetaMessage::SmpteOffset(smpte)
            }
            0x58 => {
                expect(data, 4)?;
                MetaMessage::TimeSignature(data[0], data[1], data[2], data[3])
            }
            0x59 => {
                expect(data, 2)?;
                MetaMessage::KeySignature(data[0] as i8, data[1] != 0)
            }
            0x7F => MetaMessage::SequencerSpecific(data.to_vec()),
            _ => MetaMessage::Unknown(type_byte, data.to_vec()),
        })
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut write_msg = |type_byte: u8, data: &[u8]| {
            out.push(type_byte);
            write_varlen_slice(data, out)
        };
        match self {
            MetaMessage::SequenceNumber(num) => match num {
                None => write_msg(0x00, &[]),
                Some(num) => write_msg(0x00, &num.to_be_bytes()[..]),
            },
            MetaMessage::Text(text) => write_msg(0x01, &text_bytes(text)),
            MetaMessage::Copyright(text) => write_msg(0x02, &text_bytes(text)),
            MetaMessage::TrackName(text) => write_msg(0x03, &text_bytes(text)),
            MetaMessage::InstrumentName(text) => write_msg(0x04, &text_bytes(text)),
            MetaMessage::Lyric(text) => write_msg(0x05, &text_bytes(text)),
            MetaMessage::Marker(text) => write_msg(0x06, &text_bytes(text)),
            MetaMessage::CuePoint(text) => write_msg(0x07, &text_bytes(text)),
            MetaMessage::ProgramName(text) => write_msg(0x08, &text_bytes(text)),
            MetaMessage::DeviceName(text) => write_msg(0x09, &text_bytes(text)),
            MetaMessage::ChannelPrefix(chan) => write_msg(0x20, &[chan.as_int()]),
            MetaMessage::MidiPort(port) => write_msg(0x21, &[port.as_int()]),
            MetaMessage::EndOfTrack => write_msg(0x2F, &[]),
            MetaMessage::Tempo(microsperbeat) => {
                write_msg(0x51, &microsperbeat.as_int().to_be_bytes()[1..])
            }
            MetaMessage::SmpteOffset(smpte) => write_msg(0x54, &smpte[..]),
            MetaMessage::TimeSignature(num, den, ticksperclick, thirtysecondsperquarter) => {
                write_msg(
                    0x58,
                    &[*num, *den, *ticksperclick, *thirtysecondsperquarter],
                )
            }
            MetaMessage::KeySignature(sharps, minor) => {
                write_msg(0x59, &[*sharps as u8, *minor as u8])
            }
            MetaMessage::SequencerSpecific(data) => write_msg(0x7F, data),
            MetaMessage::Unknown(type_byte, data) => write_msg(*type_byte, data),
        }
    }
}

/// The exact bytes to send to a MIDI receiver for one event.
///
/// The first byte is always the real status byte, even if the event was stored using running
/// status.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct WireMessage(Vec<u8>);
impl WireMessage {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>) -> WireMessage {
        WireMessage(bytes)
    }

    /// The raw bytes of this message.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// The status byte, if the message is not empty.
    #[inline]
    pub fn status(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Unwrap the raw bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Render the message as a textual bridge command: `midi,` followed by every byte in
    /// unpadded lowercase hex, separated by commas.
    ///
    /// For example, a note-on for middle C is rendered as `midi,90,3c,7f`.
    pub fn link_command(&self) -> String {
        use core::fmt::Write;
        let mut cmd = String::with_capacity(5 + self.0.len() * 3);
        cmd.push_str("midi");
        for byte in self.0.iter() {
            let _ = write!(cmd, ",{:x}", byte);
        }
        cmd
    }
}
impl From<Vec<u8>> for WireMessage {
    fn from(bytes: Vec<u8>) -> WireMessage {
        WireMessage(bytes)
    }
}
impl AsRef<[u8]> for WireMessage {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "WireMessage(")?;
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        write!(f, ")")
    }
}
