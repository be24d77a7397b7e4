use crate::{
    chunk::{self, ChunkLayout, ChunkReader},
    convert::{self, octave_shift, ConvertOptions},
    mfi::{ExtendedMessage, InstrumentMessage, MfiEventKind, Note, Operator, TempoMessage},
    num::{u14, u15, u2, u28, u4, u6, u7},
    ChannelMessage, Error, ErrorKind, EventKind, Format, Header, LoopConfig, LoopCount, LoopId,
    MetaMessage, Mfi, Next, Player, PlayerConfig, PlayerState, Scheduler, Smf, Timeline, Timing,
    Track, TrackEvent, Transport, WireMessage,
};
use std::time::Duration;

/// Build a Standard Midi File out of raw track bodies.
fn smf_bytes(format: u16, division: u16, tracks: &[&[u8]]) -> Vec<u8> {
    let mut out = b"MThd\0\0\0\x06".to_vec();
    out.extend_from_slice(&format.to_be_bytes());
    out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
    out.extend_from_slice(&division.to_be_bytes());
    for track in tracks {
        out.extend_from_slice(b"MTrk");
        out.extend_from_slice(&(track.len() as u32).to_be_bytes());
        out.extend_from_slice(track);
    }
    out
}

/// Build an MFi file out of information records and raw track bodies.
fn mfi_bytes(info: &[(&[u8; 4], &[u8])], tracks: &[&[u8]]) -> Vec<u8> {
    let mut info_raw = Vec::new();
    for (tag, data) in info {
        info_raw.extend_from_slice(&tag[..]);
        info_raw.extend_from_slice(&(data.len() as u16).to_be_bytes());
        info_raw.extend_from_slice(data);
    }
    let mut body = Vec::new();
    body.extend_from_slice(&((3 + info_raw.len()) as u16).to_be_bytes());
    body.extend_from_slice(&[1, 1, tracks.len() as u8]);
    body.extend_from_slice(&info_raw);
    for track in tracks {
        body.extend_from_slice(b"trac");
        body.extend_from_slice(&(track.len() as u32).to_be_bytes());
        body.extend_from_slice(track);
    }
    let mut out = b"melo".to_vec();
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Build a timeline out of `(delta, event)` lists.
fn timeline(format: Format, tpb: u16, tracks: Vec<Vec<(u32, EventKind)>>) -> Timeline {
    let tracks = tracks
        .into_iter()
        .map(|events| {
            Track::from_events(
                events
                    .into_iter()
                    .map(|(delta, kind)| TrackEvent {
                        delta: u28::new(delta),
                        time: 0,
                        kind,
                    })
                    .collect(),
            )
        })
        .collect();
    Timeline::from_smf(Smf::new(
        Header::new(format, Timing::Metrical(u15::new(tpb))),
        tracks,
    ))
}

fn note_on(channel: u8, key: u8) -> EventKind {
    EventKind::Channel {
        channel: u4::new(channel),
        message: ChannelMessage::NoteOn {
            key: u7::new(key),
            vel: u7::new(100),
        },
    }
}

fn controller(channel: u8, controller: u8, value: u8) -> EventKind {
    EventKind::Channel {
        channel: u4::new(channel),
        message: ChannelMessage::Controller {
            controller: u7::new(controller),
            value: u7::new(value),
        },
    }
}

fn marker(text: &str) -> EventKind {
    EventKind::Meta(MetaMessage::Marker(text.to_string()))
}

fn root_kind(err: &Error) -> ErrorKind {
    err.root().kind()
}

fn kinds(track: &Track) -> Vec<EventKind> {
    track.events.iter().map(|ev| ev.kind.clone()).collect()
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

mod errors {
    use super::*;
    use crate::error::ResultExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn context_wraps_the_cause() {
        let inner: core::result::Result<(), &'static ErrorKind> =
            Err(&ErrorKind::Invalid("track cut short"));
        let err = inner
            .context(&ErrorKind::Invalid("bad track"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid("bad track"));
        assert_eq!(err.kind().message(), "bad track");
        assert_eq!(err.to_string(), "invalid sequence: bad track");
        if cfg!(debug_assertions) {
            assert_eq!(root_kind(&err), ErrorKind::Invalid("track cut short"));
            assert_eq!(
                format!("{:?}", err),
                "invalid sequence: bad track\n  from invalid sequence: track cut short"
            );
        } else {
            assert!(err.source().is_none());
            assert_eq!(format!("{:?}", err), "invalid sequence: bad track");
        }
    }

    #[test]
    fn class_prefixes() {
        let err = Error::new(&ErrorKind::Precondition("no sequence loaded"));
        assert!(err.source().is_none());
        assert_eq!(err.root().kind(), err.kind());
        assert_eq!(err.to_string(), "player not ready: no sequence loaded");
        assert_eq!(
            ErrorKind::Unsupported("code 0xE3").to_string(),
            "unsupported message: code 0xE3"
        );
    }
}

mod chunks {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn consecutive_chunks() {
        let raw = b"AAAA\0\0\0\x02xyBBBB\0\0\0\x01z";
        let mut reader = ChunkReader::new(&raw[..], ChunkLayout::SMF);
        assert_eq!(reader.parse(Some(1)).unwrap(), 1);
        assert_eq!(reader.position(), 10);
        assert_eq!(reader.parse(None).unwrap(), 2);
        assert_eq!(reader.position(), raw.len());
        let first = *reader.get(0).unwrap();
        assert_eq!(&first.id, b"AAAA");
        assert_eq!(first.size, 2);
        assert_eq!(reader.data(&first), b"xy");
        let second = *reader.get(1).unwrap();
        assert_eq!(reader.data(&second), b"z");
    }

    #[test]
    fn missing_chunk() {
        let mut reader = ChunkReader::new(b"AAAA\0\0\0\0", ChunkLayout::SMF);
        reader.parse(None).unwrap();
        let err = reader.get(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid("chunk not found"));
    }

    #[test]
    fn riff_padding() {
        let raw = b"abcd\x03\0\0\0xyz\0efgh\0\0\0\0";
        let mut reader = ChunkReader::new(&raw[..], ChunkLayout::RIFF);
        assert_eq!(reader.parse(None).unwrap(), 2);
        assert_eq!(reader.data(&reader.chunks()[0]), b"xyz");
        assert_eq!(&reader.chunks()[1].id, b"efgh");
    }

    #[test]
    fn short_sizes() {
        let raw = b"titl\0\x03abcnote\0\x02\0\x01";
        let mut reader = ChunkReader::new(&raw[..], ChunkLayout::MFI_INFO);
        assert_eq!(reader.parse(None).unwrap(), 2);
        assert_eq!(reader.data(&reader.chunks()[0]), b"abc");
        assert_eq!(reader.data(&reader.chunks()[1]), &[0, 1]);
    }

    #[cfg(not(feature = "strict"))]
    #[test]
    fn overrun_is_truncated() {
        let raw = b"AAAA\0\0\0\x10ab";
        let mut reader = ChunkReader::new(&raw[..], ChunkLayout::SMF);
        assert_eq!(reader.parse(None).unwrap(), 1);
        assert_eq!(reader.data(&reader.chunks()[0]), b"ab");
    }

    #[test]
    fn rmid() {
        let smf = smf_bytes(0, 96, &[&[0x00, 0x90, 0x3C, 0x40, 0x00, 0xFF, 0x2F, 0x00]]);
        let mut data = b"RMID".to_vec();
        data.extend_from_slice(b"data");
        data.extend_from_slice(&(smf.len() as u32).to_le_bytes());
        data.extend_from_slice(&smf);
        if smf.len() % 2 == 1 {
            data.push(0);
        }
        let mut riff = b"RIFF".to_vec();
        riff.extend_from_slice(&(data.len() as u32).to_le_bytes());
        riff.extend_from_slice(&data);

        assert_eq!(chunk::unwrap_rmid(&riff).unwrap(), &smf[..]);
        assert_eq!(Smf::parse(&riff).unwrap(), Smf::parse(&smf).unwrap());
    }
}

mod varlen {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode(n: u32) -> Vec<u8> {
        let mut out = Vec::new();
        u28::new(n).write_varlen(&mut out);
        out
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(0x40), vec![0x40]);
        assert_eq!(encode(0x7F), vec![0x7F]);
        assert_eq!(encode(0x80), vec![0x81, 0x00]);
        assert_eq!(encode(0x2000), vec![0xC0, 0x00]);
        assert_eq!(encode(0x3FFF), vec![0xFF, 0x7F]);
        assert_eq!(encode(0x4000), vec![0x81, 0x80, 0x00]);
        assert_eq!(encode(0x0FFF_FFFF), vec![0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn encode_decode_law() {
        let mut n: u32 = 0;
        while n < 1 << 28 {
            let bytes = encode(n);
            let (last, init) = bytes.split_last().unwrap();
            assert!(last & 0x80 == 0, "last byte of {} has continuation bit", n);
            assert!(init.iter().all(|b| b & 0x80 != 0));
            if bytes.len() > 1 {
                assert_ne!(bytes[0], 0x80, "{} encoded with a leading zero group", n);
            }
            let mut raw = &bytes[..];
            assert_eq!(u28::read_varlen(&mut raw).unwrap().as_int(), n);
            assert!(raw.is_empty());
            n = n * 3 + 1;
        }
    }

    #[test]
    fn truncated() {
        let mut raw = &[0x81, 0x80][..];
        assert!(u28::read_varlen(&mut raw).is_err());
    }
}

mod parse {
    use super::*;
    use pretty_assertions::assert_eq;

    fn single(track: &[u8]) -> Track {
        let mut smf = Smf::parse(&smf_bytes(1, 96, &[track])).unwrap();
        smf.tracks.remove(0)
    }

    fn single_err(track: &[u8]) -> Error {
        Smf::parse(&smf_bytes(1, 96, &[track])).unwrap_err()
    }

    #[test]
    fn header() {
        let smf = Smf::parse(&smf_bytes(0, 96, &[&[0x00, 0xFF, 0x2F, 0x00]])).unwrap();
        assert_eq!(
            smf.header,
            Header::new(Format::SingleTrack, Timing::Metrical(u15::new(96)))
        );
        assert_eq!(smf.tracks.len(), 1);

        let smf = Smf::parse(&smf_bytes(2, 0xE728, &[])).unwrap();
        assert_eq!(
            smf.header,
            Header::new(Format::Sequential, Timing::Timecode(25, 40))
        );
        assert_eq!(smf.to_bytes().unwrap(), smf_bytes(2, 0xE728, &[]));
    }

    #[test]
    fn running_status() {
        let track = single(&[
            0x00, 0x90, 0x3C, 0x40, //
            0x10, 0x3E, 0x40, //
            0x10, 0x80, 0x3C, 0x00, //
            0x00, 0x3E, 0x00, //
            0x00, 0xFF, 0x2F, 0x00,
        ]);
        assert_eq!(track.len(), 5);
        assert_eq!(track.wire.len(), 5);
        assert_eq!(
            track.events[1],
            TrackEvent {
                delta: u28::new(0x10),
                time: 0x10,
                kind: EventKind::Channel {
                    channel: u4::new(0),
                    message: ChannelMessage::NoteOn {
                        key: u7::new(0x3E),
                        vel: u7::new(0x40),
                    },
                },
            }
        );
        assert_eq!(track.wire[1].as_bytes(), &[0x90, 0x3E, 0x40]);
        assert_eq!(track.wire[3].as_bytes(), &[0x80, 0x3E, 0x00]);
        assert_eq!(track.events[4].time, 0x20);
    }

    #[test]
    fn zero_velocity_note_on() {
        let track = single(&[0x00, 0x93, 60, 0x00]);
        assert_eq!(
            track.events[0].kind,
            EventKind::Channel {
                channel: u4::new(3),
                message: ChannelMessage::NoteOff {
                    key: u7::new(60),
                    vel: u7::new(0),
                },
            }
        );
        assert_eq!(track.wire[0].as_bytes(), &[0x83, 60, 0]);
    }

    #[test]
    fn other_channel_messages() {
        let track = single(&[
            0x00, 0xC5, 0x10, //
            0x00, 0xE1, 0x00, 0x40, //
            0x00, 0xD2, 0x33,
        ]);
        assert_eq!(
            kinds(&track),
            vec![
                EventKind::Channel {
                    channel: u4::new(5),
                    message: ChannelMessage::ProgramChange {
                        program: u7::new(0x10)
                    },
                },
                EventKind::Channel {
                    channel: u4::new(1),
                    message: ChannelMessage::PitchBend {
                        bend: u14::new(0x2000)
                    },
                },
                EventKind::Channel {
                    channel: u4::new(2),
                    message: ChannelMessage::ChannelAftertouch { vel: u7::new(0x33) },
                },
            ]
        );
        assert_eq!(track.wire[1].as_bytes(), &[0xE1, 0x00, 0x40]);
    }

    #[test]
    fn sysex_and_escape() {
        let track = single(&[
            0x00, 0xF0, 0x03, 0x7E, 0x01, 0xF7, //
            0x00, 0xF7, 0x02, 0xF8, 0xFA,
        ]);
        assert_eq!(
            kinds(&track),
            vec![EventKind::SysEx(vec![0x7E, 0x01]), EventKind::Escape(vec![0xF8, 0xFA])]
        );
        assert_eq!(track.wire[0].as_bytes(), &[0xF0, 0x7E, 0x01, 0xF7]);
        assert_eq!(track.wire[1].as_bytes(), &[0xF8, 0xFA]);
    }

    #[test]
    fn unterminated_sysex() {
        let err = single_err(&[0x00, 0xF0, 0x02, 0x7E, 0x01]);
        assert_eq!(
            root_kind(&err),
            ErrorKind::Invalid("sysex event missing its 0xF7 terminator")
        );
    }

    #[test]
    fn meta_messages() {
        let track = single(&[
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, //
            0x00, 0xFF, 0x06, 0x01, b'A', //
            0x00, 0xFF, 0x59, 0x02, 0xFD, 0x01, //
            0x00, 0xFF, 0x58, 0x04, 0x06, 0x03, 0x18, 0x08, //
            0x00, 0xFF, 0x03, 0x04, b'S', b'o', b'n', b'g', //
            0x00, 0xFF, 0x60, 0x01, 0x05, //
            0x00, 0xFF, 0x2F, 0x00,
        ]);
        assert_eq!(
            kinds(&track),
            vec![
                EventKind::Meta(MetaMessage::Tempo(500_000.into())),
                EventKind::Meta(MetaMessage::Marker("A".to_string())),
                EventKind::Meta(MetaMessage::KeySignature(-3, true)),
                EventKind::Meta(MetaMessage::TimeSignature(6, 3, 24, 8)),
                EventKind::Meta(MetaMessage::TrackName("Song".to_string())),
                EventKind::Meta(MetaMessage::Unknown(0x60, vec![0x05])),
                EventKind::Meta(MetaMessage::EndOfTrack),
            ]
        );
        assert_eq!(track.events[0].kind.tempo(), Some(500_000));
        assert_eq!(track.events[1].kind.marker(), Some("A"));
        assert_eq!(
            track.wire[0].as_bytes(),
            &[0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20]
        );
    }

    #[test]
    fn short_meta_payload() {
        let err = single_err(&[0x00, 0xFF, 0x51, 0x02, 0x07, 0xA1]);
        assert_eq!(
            root_kind(&err),
            ErrorKind::Invalid("meta message payload too short")
        );
    }

    #[test]
    fn system_common_in_track() {
        let err = single_err(&[0x00, 0xF2, 0x00, 0x00]);
        assert!(matches!(root_kind(&err), ErrorKind::Invalid(_)));
    }

    #[test]
    fn missing_status() {
        let err = single_err(&[0x00, 0x3C, 0x40]);
        assert_eq!(
            root_kind(&err),
            ErrorKind::Invalid("event missing status with no running status active")
        );
    }

    #[test]
    fn signatures() {
        let mut raw = smf_bytes(1, 96, &[&[]]);
        raw[3] = b'x';
        assert_eq!(
            Smf::parse(&raw).unwrap_err().kind(),
            ErrorKind::Invalid("invalid header signature")
        );

        let mut raw = smf_bytes(1, 96, &[&[]]);
        raw[17] = b'x';
        assert_eq!(
            Smf::parse(&raw).unwrap_err().kind(),
            ErrorKind::Invalid("invalid track signature")
        );

        let mut raw = smf_bytes(1, 96, &[&[]]);
        raw[11] = 2;
        assert_eq!(
            Smf::parse(&raw).unwrap_err().kind(),
            ErrorKind::Invalid("missing track chunk")
        );
    }

    #[test]
    fn link_command() {
        let wire = WireMessage::new(vec![0x90, 0x3C, 0x7F]);
        assert_eq!(wire.link_command(), "midi,90,3c,7f");
        assert_eq!(wire.status(), Some(0x90));
        assert_eq!(format!("{:?}", wire), "WireMessage(90 3C 7F)");
    }
}

mod write {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rewrite_is_identical() {
        let raw = smf_bytes(
            1,
            480,
            &[
                &[
                    0x00, 0xFF, 0x03, 0x02, b'h', b'i', //
                    0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, //
                    0x00, 0xFF, 0x2F, 0x00,
                ],
                &[
                    0x00, 0xC0, 0x05, //
                    0x00, 0x90, 0x3C, 0x40, //
                    0x83, 0x60, 0x3E, 0x40, //
                    0x00, 0x80, 0x3C, 0x00, //
                    0x81, 0x00, 0x3E, 0x00, //
                    0x00, 0xF0, 0x03, 0x7E, 0x01, 0xF7, //
                    0x00, 0xFF, 0x2F, 0x00,
                ],
            ],
        );
        let smf = Smf::parse(&raw).unwrap();
        let rewritten = smf.to_bytes().unwrap();
        assert_eq!(rewritten, raw);
        assert_eq!(Smf::parse(&rewritten).unwrap(), smf);
    }

    #[test]
    fn rewrite_keeps_deltas_and_status() {
        let raw = smf_bytes(
            1,
            96,
            &[&[
                0x00, 0x90, 0x3C, 0x40, //
                0x10, 0x3C, 0x00, //
                0x20, 0xB3, 0x07, 0x64, //
                0x05, 0xFF, 0x2F, 0x00,
            ]],
        );
        let smf = Smf::parse(&raw).unwrap();
        let timeline = Timeline::from_smf(Smf::parse(&smf.to_bytes().unwrap()).unwrap());
        let source = &smf.tracks[0];
        assert_eq!(timeline.len(), source.len());
        for (merged, (ev, wire)) in timeline
            .events()
            .iter()
            .zip(source.events.iter().zip(source.wire.iter()))
        {
            assert_eq!(merged.event.delta, ev.delta);
            assert_eq!(merged.wire.status(), wire.status());
        }
    }
}

mod mfi {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_track(note_flag: bool, track: &[u8]) -> Vec<MfiEventKind> {
        let info: &[(&[u8; 4], &[u8])] = if note_flag {
            &[(b"note", &[0, 1])]
        } else {
            &[]
        };
        let mfi = Mfi::parse(&mfi_bytes(info, &[track])).unwrap();
        mfi.tracks[0].iter().map(|ev| ev.kind.clone()).collect()
    }

    fn parse_err(track: &[u8]) -> Error {
        Mfi::parse(&mfi_bytes(&[], &[track])).unwrap_err()
    }

    #[test]
    fn header_and_info() {
        let raw = mfi_bytes(
            &[
                (b"titl", b"Song"),
                (b"copy", b"(c) me"),
                (b"sorc", &[2]),
                (b"note", &[0, 1]),
                (b"abcd", &[9]),
            ],
            &[&[0x00, 0xFF, 0xC3, 60, 0x00, 0x0C, 24, 161], &[]],
        );
        let mfi = Mfi::parse(&raw).unwrap();
        assert_eq!(mfi.info.file_length as usize, raw.len() - 8);
        assert_eq!(mfi.info.track_count, 2);
        assert_eq!(mfi.info.track_offset, 13 + 10 + 12 + 7 + 8 + 7);
        assert_eq!(mfi.info.title.as_deref(), Some("Song"));
        assert_eq!(mfi.info.copyright.as_deref(), Some("(c) me"));
        assert_eq!(mfi.info.source, Some(2));
        assert_eq!(mfi.info.note, Some(1));
        assert!(mfi.info.note_flag());
        assert_eq!(mfi.info.other, vec![(*b"abcd", vec![9])]);
        assert_eq!(mfi.track_count(), 2);
        assert_eq!(
            mfi.tracks[0][1].kind,
            MfiEventKind::Note(Note {
                voice: u2::new(0),
                key: u6::new(12),
                length: 24,
                velocity: Some(u6::new(40)),
                octave_shift: Some(u2::new(1)),
            })
        );
        assert!(mfi.tracks[1].is_empty());
    }

    #[test]
    fn notes_without_flag() {
        let records = parse_track(false, &[0x05, 0x8A, 0x30]);
        assert_eq!(
            records,
            vec![MfiEventKind::Note(Note {
                voice: u2::new(2),
                key: u6::new(10),
                length: 0x30,
                velocity: None,
                octave_shift: None,
            })]
        );
    }

    #[test]
    fn tempo_time_base() {
        let records = parse_track(false, &[0x00, 0xFF, 0xC3, 60, 0x00, 0xFF, 0xCC, 1, 0x00, 0xFF, 0xC7, 1]);
        let tempos: Vec<_> = records
            .iter()
            .map(|kind| match kind {
                MfiEventKind::Tempo(tempo) => *tempo,
                _ => panic!("expected a tempo record"),
            })
            .collect();
        assert_eq!(
            tempos[0],
            TempoMessage {
                time_base: Some(48),
                tempo: 60
            }
        );
        assert_eq!(tempos[0].micros_per_beat(), Some(1_000_000));
        assert_eq!(tempos[1].time_base, Some(240));
        assert_eq!(tempos[2].time_base, None);
        assert_eq!(tempos[2].micros_per_beat(), None);
    }

    #[test]
    fn volume_change_is_signed() {
        let records = parse_track(false, &[0x00, 0xFF, 0xE6, 0x7F]);
        assert_eq!(
            records,
            vec![MfiEventKind::Instrument {
                part: u2::new(1),
                message: InstrumentMessage::VolumeChange(-1),
            }]
        );
    }

    #[test]
    fn edit_instrument() {
        let records = parse_track(
            false,
            &[
                0x00, 0xFF, 0xF0, 0x00, 11, 0x01, //
                0x20, 0xB6, 0x4F, 0x95, 0x2E, 0x00, 0x00, 0x00, 0x00, 0x03,
            ],
        );
        let sets = match &records[0] {
            MfiEventKind::Extended(ExtendedMessage::EditInstrument(sets)) => sets,
            other => panic!("unexpected record {:?}", other),
        };
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].part, u2::new(2));
        assert_eq!(sets[0].octave_select, u2::new(3));
        assert_eq!(
            sets[0].modulator,
            Operator {
                multiple: 5,
                vibrato: true,
                envelope: false,
                sustain: true,
                release_rate: 9,
                decay_rate: 4,
                attack_rate: 14,
                sustain_level: 9,
                total_level: 18,
                waveform: 1,
                feedback: 6,
            }
        );
        assert_eq!(sets[0].carrier.total_level, 0);
    }

    #[test]
    fn vibrato_and_device_specific() {
        let records = parse_track(
            false,
            &[
                0x00, 0xFF, 0xF1, 0x00, 0x03, 0x01, 0x60, 0x40, //
                0x00, 0xFF, 0xFF, 0x00, 0x03, 0x11, 0xAA, 0xBB,
            ],
        );
        assert_eq!(
            records,
            vec![
                MfiEventKind::Extended(ExtendedMessage::Vibrato {
                    part: u2::new(3),
                    switch: u2::new(1),
                }),
                MfiEventKind::Extended(ExtendedMessage::DeviceSpecific(vec![0xAA, 0xBB])),
            ]
        );
    }

    #[test]
    fn bad_constants() {
        let err = parse_err(&[0x00, 0xFF, 0xF1, 0x00, 0x03, 0x02, 0x00, 0x00]);
        assert_eq!(root_kind(&err), ErrorKind::Invalid("invalid vibrato constant"));
        let err = parse_err(&[0x00, 0xFF, 0xFF, 0x00, 0x01, 0x10]);
        assert_eq!(
            root_kind(&err),
            ErrorKind::Invalid("invalid device specific constant")
        );
    }

    #[test]
    fn unknown_codes() {
        let err = parse_err(&[0x00, 0xFF, 0xA0, 0x00]);
        assert_eq!(
            root_kind(&err),
            ErrorKind::Unsupported("unknown mfi message class")
        );
        let err = parse_err(&[0x00, 0xFF, 0xEF, 0x00]);
        assert_eq!(
            root_kind(&err),
            ErrorKind::Unsupported("unknown mfi instrument message")
        );
        let err = parse_err(&[0x00, 0xFF, 0xB5, 0x00]);
        assert_eq!(
            root_kind(&err),
            ErrorKind::Unsupported("unknown mfi system message")
        );
    }

    #[test]
    fn signatures() {
        let mut raw = mfi_bytes(&[], &[&[]]);
        raw[3] = b'a';
        assert_eq!(
            Mfi::parse(&raw).unwrap_err().kind(),
            ErrorKind::Invalid("invalid mfi signature")
        );

        let mut raw = mfi_bytes(&[], &[&[]]);
        raw[13] = b'x';
        assert_eq!(
            Mfi::parse(&raw).unwrap_err().kind(),
            ErrorKind::Invalid("invalid mfi track signature")
        );
    }

    #[test]
    fn truncated_record() {
        let err = parse_err(&[0x00, 0xFF]);
        assert!(matches!(root_kind(&err), ErrorKind::Invalid(_)));
    }
}

mod convert_mfi {
    use super::*;
    use pretty_assertions::assert_eq;

    fn convert_tracks(info: &[(&[u8; 4], &[u8])], tracks: &[&[u8]], options: &ConvertOptions) -> Smf {
        let mfi = Mfi::parse(&mfi_bytes(info, tracks)).unwrap();
        convert::convert(&mfi, options).unwrap()
    }

    fn eot() -> EventKind {
        EventKind::Meta(MetaMessage::EndOfTrack)
    }

    fn channel(channel: u8, message: ChannelMessage) -> EventKind {
        EventKind::Channel {
            channel: u4::new(channel),
            message,
        }
    }

    fn cc(ch: u8, controller: u8, value: u8) -> EventKind {
        super::controller(ch, controller, value)
    }

    #[test]
    fn octave_shift_table() {
        assert_eq!(octave_shift(60, 0).unwrap(), 60);
        assert_eq!(octave_shift(60, 1).unwrap(), 72);
        assert_eq!(octave_shift(60, 2).unwrap(), 36);
        assert_eq!(octave_shift(60, 3).unwrap(), 48);
        for key in 0..=255 {
            assert_eq!(
                octave_shift(key, 4).unwrap_err().kind(),
                ErrorKind::Invalid("invalid octave shift value")
            );
        }
    }

    #[test]
    fn layout_and_loops() {
        let track: &[u8] = &[
            0x00, 0xFF, 0xC3, 60, //
            0x00, 0xFF, 0xDD, 1 << 6 | 2 << 2, //
            0x00, 0x0F, 48, //
            48, 0xFF, 0xDD, 1 << 6 | 2 << 2 | 1, //
            0x00, 0xFF, 0xDD, 3 << 6, //
            0x00, 0xFF, 0xDF, 0x00,
        ];
        let mfi = Mfi::parse(&mfi_bytes(&[(b"copy", b"(c)")], &[track])).unwrap();
        let raw = convert::to_smf(&mfi, &ConvertOptions::default()).unwrap();
        assert_eq!(&raw[..14], b"MThd\0\0\0\x06\0\x01\0\x10\0\x30");
        assert_eq!(raw, mfi.to_smf(&ConvertOptions::default()).unwrap());

        let smf = Smf::parse(&raw).unwrap();
        assert_eq!(smf.header.format, Format::Parallel);
        assert_eq!(smf.header.timing, Timing::Metrical(u15::new(48)));
        assert_eq!(smf.tracks.len(), 16);
        let key = u7::new(15 + 45);
        let vel = u7::new(126);
        assert_eq!(
            kinds(&smf.tracks[0]),
            vec![
                EventKind::Meta(MetaMessage::Copyright("(c)".to_string())),
                EventKind::Meta(MetaMessage::Tempo(1_000_000.into())),
                marker("LOOP_START=ID:1,COUNT:2"),
                channel(0, ChannelMessage::NoteOn { key, vel }),
                channel(0, ChannelMessage::NoteOff { key, vel }),
                marker("LOOP_END=ID:1,COUNT:2"),
                marker("LOOP_START=ID:3,COUNT:-1"),
                eot(),
            ]
        );
        let deltas: Vec<u32> = smf.tracks[0]
            .events
            .iter()
            .map(|ev| ev.delta.as_int())
            .collect();
        assert_eq!(deltas, vec![0, 0, 0, 0, 48, 0, 0, 0]);
        for track in &smf.tracks[1..] {
            assert_eq!(kinds(track), vec![eot()]);
        }
    }

    #[test]
    fn rhythm_channel() {
        let tracks: &[&[u8]] = &[&[], &[], &[0x00, 1 << 6 | 15, 10]];
        let smf = convert_tracks(&[], tracks, &ConvertOptions::default());
        assert_eq!(
            smf.tracks[9].events[0].kind,
            channel(
                9,
                ChannelMessage::NoteOn {
                    key: u7::new(50),
                    vel: u7::new(126)
                }
            )
        );
        let options = ConvertOptions {
            rhythm_key_offset: false,
            default_velocity: 20,
        };
        let smf = convert_tracks(&[], tracks, &options);
        assert_eq!(
            smf.tracks[9].events[0].kind,
            channel(
                9,
                ChannelMessage::NoteOn {
                    key: u7::new(60),
                    vel: u7::new(40)
                }
            )
        );
    }

    #[test]
    fn note_flag_velocity_and_shift() {
        let smf = convert_tracks(
            &[(b"note", &[0, 1])],
            &[&[0x00, 0x0F, 10, 20 << 2 | 3]],
            &ConvertOptions::default(),
        );
        assert_eq!(
            smf.tracks[0].events[0].kind,
            channel(
                0,
                ChannelMessage::NoteOn {
                    key: u7::new(48),
                    vel: u7::new(40)
                }
            )
        );
    }

    #[test]
    fn controllers() {
        let smf = convert_tracks(
            &[],
            &[&[
                0x00, 0xFF, 0xE2, 50, //
                0x00, 0xFF, 0xE3, 32, //
                0x00, 0xFF, 0xE4, 32, //
                0x00, 0xFF, 0xE7, 2, //
                0x00, 0xFF, 0xEA, 10, //
                0x00, 0xFF, 0xE9, 1,
            ]],
            &ConvertOptions::default(),
        );
        assert_eq!(
            kinds(&smf.tracks[0]),
            vec![
                cc(0, 0x07, 100),
                cc(0, 0x0A, 64),
                channel(
                    0,
                    ChannelMessage::PitchBend {
                        bend: u14::new(64 << 7 | 64)
                    }
                ),
                cc(0, 0x64, 0x00),
                cc(0, 0x65, 0x00),
                cc(0, 0x06, 4),
                cc(0, 0x01, 20),
                cc(0, 0x64, 0x02),
                cc(0, 0x65, 0x00),
                cc(0, 0x06, 2),
                eot(),
            ]
        );
    }

    #[test]
    fn program_change_and_master_volume() {
        let smf = convert_tracks(
            &[],
            &[&[
                0x00, 0xFF, 0xE1, 1 << 6 | 1, //
                0x04, 0xFF, 0xE0, 1 << 6 | 5, //
                0x00, 0xFF, 0xB0, 100,
            ]],
            &ConvertOptions::default(),
        );
        assert_eq!(
            kinds(&smf.tracks[1]),
            vec![
                channel(
                    1,
                    ChannelMessage::ProgramChange {
                        program: u7::new(69)
                    }
                ),
                eot(),
            ]
        );
        assert_eq!(smf.tracks[1].events[0].time, 4);
        assert_eq!(
            smf.tracks[0].wire[0].as_bytes(),
            &[0xF0, 0x7F, 0x7F, 0x04, 0x01, 100, 100, 0xF7]
        );
    }

    #[test]
    fn broken_instrument() {
        let mfi = Mfi::parse(&mfi_bytes(
            &[],
            &[&[0x00, 0xFF, 0xE1, 0x01, 0x00, 0xFF, 0xE2, 0x10]],
        ))
        .unwrap();
        let err = convert::to_smf(&mfi, &ConvertOptions::default()).unwrap_err();
        assert_eq!(
            root_kind(&err),
            ErrorKind::Invalid("broken instrument: high part not followed by low part")
        );
    }

    #[test]
    fn too_many_tracks() {
        let mfi = Mfi::parse(&mfi_bytes(&[], &[&[], &[], &[], &[], &[]])).unwrap();
        assert!(convert::to_smf(&mfi, &ConvertOptions::default()).is_err());
    }
}

mod merge {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text(s: &str) -> EventKind {
        EventKind::Meta(MetaMessage::Text(s.to_string()))
    }

    #[test]
    fn stable_order() {
        let timeline = timeline(
            Format::Parallel,
            96,
            vec![
                vec![(0, text("a")), (5, text("b")), (0, text("c"))],
                vec![(5, text("d"))],
                vec![(2, text("e"))],
            ],
        );
        let order: Vec<(usize, usize, u64)> = timeline
            .events()
            .iter()
            .map(|ev| (ev.track, ev.index, ev.time))
            .collect();
        assert_eq!(
            order,
            vec![(0, 0, 0), (2, 0, 2), (0, 1, 5), (0, 2, 5), (1, 0, 5)]
        );
        assert_eq!(
            timeline.events()[1].wire.as_bytes(),
            &[0xFF, 0x01, 0x01, b'e']
        );
    }

    #[test]
    fn metadata() {
        let name = EventKind::Meta(MetaMessage::TrackName("Tune".to_string()));
        let copy = |s: &str| EventKind::Meta(MetaMessage::Copyright(s.to_string()));

        let single = timeline(
            Format::SingleTrack,
            96,
            vec![vec![(0, copy("one")), (0, name.clone()), (0, copy("two"))]],
        );
        assert_eq!(single.sequence_name(), Some("Tune"));
        assert_eq!(single.copyrights(), &["one".to_string(), "two".to_string()]);

        let parallel = timeline(
            Format::Parallel,
            96,
            vec![vec![(10, copy("late"))], vec![(0, name), (0, copy("early"))]],
        );
        assert_eq!(parallel.sequence_name(), None);
        assert_eq!(
            parallel.copyrights(),
            &["late".to_string(), "early".to_string()]
        );
    }
}

mod scheduler {
    use super::*;
    use pretty_assertions::assert_eq;

    fn loops(f: impl FnOnce(&mut LoopConfig)) -> LoopConfig {
        let mut loops = LoopConfig::default();
        f(&mut loops);
        loops
    }

    /// Step until the timeline finishes or `max` cycles ran, returning the tick of every cycle.
    fn run(timeline: &Timeline, loops: LoopConfig, max: usize) -> (Vec<u64>, bool, PlayerState) {
        let scheduler = Scheduler::new(loops, 1.0);
        let mut state = PlayerState::default();
        let mut ticks = Vec::new();
        for _ in 0..max {
            ticks.push(timeline.events()[state.position].time);
            let cycle = scheduler.step(timeline, state, Duration::ZERO);
            state = cycle.state;
            if cycle.next == Next::Finished {
                return (ticks, true, state);
            }
        }
        (ticks, false, state)
    }

    #[test]
    fn delays() {
        let timeline = timeline(
            Format::Parallel,
            96,
            vec![vec![(0, note_on(0, 60)), (96, note_on(0, 62))]],
        );
        let scheduler = Scheduler::new(LoopConfig::default(), 1.0);
        let cycle = scheduler.step(&timeline, PlayerState::default(), Duration::ZERO);
        assert_eq!(cycle.dispatch.len(), 1);
        assert_eq!(cycle.dispatch[0].as_bytes(), &[0x90, 60, 100]);
        assert_eq!(cycle.state.position, 1);
        assert_eq!(cycle.next, Next::Wait(ms(500)));

        let cycle = scheduler.step(&timeline, PlayerState::default(), ms(100));
        assert_eq!(cycle.next, Next::Wait(ms(400)));
        assert_eq!(cycle.behind, Duration::ZERO);
        let cycle = scheduler.step(&timeline, PlayerState::default(), ms(900));
        assert_eq!(cycle.next, Next::Wait(Duration::ZERO));
        assert_eq!(cycle.behind, ms(400));

        let fast = Scheduler::new(LoopConfig::default(), 2.0);
        let cycle = fast.step(&timeline, PlayerState::default(), Duration::ZERO);
        assert_eq!(cycle.next, Next::Wait(ms(250)));

        let cycle = scheduler.step(&timeline, cycle.state, Duration::ZERO);
        assert_eq!(cycle.next, Next::Finished);
    }

    #[test]
    fn tempo_changes() {
        let timeline = timeline(
            Format::Parallel,
            96,
            vec![
                vec![(0, EventKind::Meta(MetaMessage::Tempo(1_000_000.into())))],
                vec![(0, note_on(1, 60)), (48, note_on(1, 62))],
            ],
        );
        let scheduler = Scheduler::new(LoopConfig::default(), 1.0);
        let cycle = scheduler.step(&timeline, PlayerState::default(), Duration::ZERO);
        assert_eq!(cycle.dispatch.len(), 2);
        assert_eq!(cycle.state.tempo, 1_000_000);
        assert_eq!(cycle.next, Next::Wait(ms(500)));
    }

    #[test]
    fn invalid_rate_counts_as_one() {
        let timing = Timing::Metrical(u15::new(96));
        for rate in [0.0, -2.0, f64::NAN, f64::INFINITY] {
            let scheduler = Scheduler::new(LoopConfig::default(), rate);
            assert_eq!(
                scheduler.delay(timing, 500_000, 96),
                timing.span(500_000, 96)
            );
        }
    }

    #[test]
    fn restart_absorbs_lateness() {
        let timeline = timeline(
            Format::Parallel,
            96,
            vec![vec![(48, note_on(0, 60)), (96, note_on(0, 62))]],
        );
        let scheduler = Scheduler::new(loops(|l| l.simple = true), 1.0);
        let at_end = || PlayerState {
            position: 2,
            ..PlayerState::default()
        };
        let cycle = scheduler.step(&timeline, at_end(), ms(100));
        assert_eq!(cycle.state.position, 0);
        assert_eq!(cycle.next, Next::Wait(ms(150)));
        assert_eq!(cycle.behind, Duration::ZERO);

        let cycle = scheduler.step(&timeline, at_end(), ms(300));
        assert_eq!(cycle.next, Next::Wait(Duration::ZERO));
        assert_eq!(cycle.behind, ms(50));
    }

    #[test]
    fn timecode_delay() {
        let scheduler = Scheduler::new(LoopConfig::default(), 1.0);
        assert_eq!(
            scheduler.delay(Timing::Timecode(25, 40), 123, 100),
            ms(100)
        );
    }

    fn counted_loop(count: &str) -> Timeline {
        timeline(
            Format::Parallel,
            96,
            vec![vec![
                (0, note_on(0, 60)),
                (10, marker(&format!("LOOP_START=ID:2,COUNT:{}", count))),
                (10, note_on(0, 62)),
                (10, marker(&format!("LOOP_END=ID:2,COUNT:{}", count))),
                (10, note_on(0, 64)),
            ]],
        )
    }

    #[test]
    fn counted_loop_runs_once() {
        let timeline = counted_loop("1");
        let (ticks, finished, state) = run(&timeline, loops(|l| l.mfi_counted = true), 32);
        assert!(finished);
        assert_eq!(ticks, vec![0, 10, 20, 30, 10, 20, 30, 40]);
        assert!(state.marks.is_empty());

        let (ticks, finished, state) = run(&timeline, LoopConfig::default(), 32);
        assert!(finished);
        assert_eq!(ticks, vec![0, 10, 20, 30, 40]);
        assert_eq!(
            state.marks.get(&LoopId::Mfi(2)).map(|mark| mark.count),
            Some(LoopCount::Finite(1))
        );
    }

    #[test]
    fn loop_end_is_not_dispatched_when_jumping() {
        let timeline = counted_loop("1");
        let scheduler = Scheduler::new(loops(|l| l.mfi_counted = true), 1.0);
        let mut state = PlayerState {
            position: 3,
            ..PlayerState::default()
        };
        state.marks.insert(
            LoopId::Mfi(2),
            crate::LoopMark {
                position: 1,
                count: LoopCount::Finite(1),
            },
        );
        let cycle = scheduler.step(&timeline, state.clone(), Duration::ZERO);
        assert!(cycle.dispatch.is_empty());
        assert_eq!(cycle.state.position, 1);
        assert_eq!(cycle.next, Next::Wait(Duration::ZERO));
        assert_eq!(cycle.behind, Duration::ZERO);

        //A late jump keeps its lateness for the cycle it jumps to
        let cycle = scheduler.step(&timeline, state, ms(100));
        assert_eq!(cycle.state.position, 1);
        assert_eq!(cycle.next, Next::Wait(Duration::ZERO));
        assert_eq!(cycle.behind, ms(100));
    }

    #[test]
    fn infinite_loop() {
        let timeline = counted_loop("-1");
        let (ticks, finished, state) = run(&timeline, loops(|l| l.mfi_counted = true), 40);
        assert!(!finished);
        assert_eq!(&ticks[..7], &[0, 10, 20, 30, 10, 20, 30]);
        assert_eq!(
            state.marks.get(&LoopId::Mfi(2)).map(|mark| mark.count),
            Some(LoopCount::Infinite)
        );
    }

    #[test]
    fn marker_loop() {
        let timeline = timeline(
            Format::Parallel,
            96,
            vec![vec![
                (0, marker("A")),
                (10, note_on(0, 60)),
                (10, marker("B")),
                (10, note_on(0, 62)),
            ]],
        );
        let (ticks, finished, _) = run(&timeline, loops(|l| l.marker_ab = true), 7);
        assert!(!finished);
        assert_eq!(ticks, vec![0, 10, 20, 0, 10, 20, 0]);

        let (ticks, finished, state) = run(&timeline, LoopConfig::default(), 8);
        assert!(finished);
        assert_eq!(ticks, vec![0, 10, 20, 30]);
        assert_eq!(
            state.marks.get(&LoopId::Implicit).map(|mark| mark.position),
            Some(0)
        );
    }

    #[test]
    fn cc111_loop() {
        let timeline = timeline(
            Format::Parallel,
            96,
            vec![vec![
                (0, note_on(0, 60)),
                (10, controller(0, 111, 0)),
                (10, note_on(0, 62)),
            ]],
        );
        let scheduler = Scheduler::new(loops(|l| l.cc111 = true), 1.0);
        let state = PlayerState {
            position: 2,
            ..PlayerState::default()
        };
        let cycle = scheduler.step(&timeline, state, Duration::ZERO);
        assert_eq!(cycle.next, Next::Finished);

        let (ticks, finished, _) = run(&timeline, loops(|l| l.cc111 = true), 6);
        assert!(!finished);
        assert_eq!(ticks, vec![0, 10, 20, 10, 20, 10]);

        let (ticks, finished, _) = run(&timeline, LoopConfig::default(), 6);
        assert!(finished);
        assert_eq!(ticks, vec![0, 10, 20]);
    }

    #[test]
    fn simple_loop() {
        let timeline = timeline(
            Format::Parallel,
            96,
            vec![vec![
                (5, EventKind::Meta(MetaMessage::Tempo(1_000_000.into()))),
                (5, note_on(0, 60)),
            ]],
        );
        let scheduler = Scheduler::new(loops(|l| l.simple = true), 1.0);
        let cycle = scheduler.step(&timeline, PlayerState::default(), Duration::ZERO);
        assert_eq!(cycle.state.tempo, 1_000_000);
        let cycle = scheduler.step(&timeline, cycle.state, Duration::ZERO);
        assert_eq!(cycle.dispatch.len(), 1);
        assert_eq!(cycle.state, PlayerState::default());
        assert_eq!(
            cycle.next,
            Next::Wait(Timing::Metrical(u15::new(96)).span(500_000, 5))
        );
    }
}

mod player {
    use super::*;
    use pretty_assertions::assert_eq;

    type TestPlayer = Player<Vec<Vec<u8>>>;

    fn song() -> Vec<u8> {
        smf_bytes(
            0,
            96,
            &[&[
                0x00, 0xFF, 0x03, 0x04, b'T', b'u', b'n', b'e', //
                0x00, 0x90, 0x3C, 0x40, //
                0x60, 0x80, 0x3C, 0x00, //
                0x00, 0xFF, 0x2F, 0x00,
            ]],
        )
    }

    fn loaded() -> TestPlayer {
        let mut player = TestPlayer::new(PlayerConfig::default());
        player.set_sink(Vec::new());
        player.load_smf(&song()).unwrap();
        player.sink_mut().unwrap().clear();
        player
    }

    #[test]
    fn preconditions() {
        let mut player = TestPlayer::new(PlayerConfig::default());
        player.load_smf(&song()).unwrap();
        assert_eq!(
            player.play(ms(0)).unwrap_err().kind(),
            ErrorKind::Precondition("no sink to send messages to")
        );
        assert_eq!(player.transport(), Transport::Stopped);

        let mut player = TestPlayer::new(PlayerConfig::default());
        player.set_sink(Vec::new());
        assert_eq!(
            player.play(ms(0)).unwrap_err().kind(),
            ErrorKind::Precondition("no sequence loaded")
        );
        assert_eq!(player.transport(), Transport::Stopped);

        assert!(player.set_tempo_rate(0.0).is_err());
        assert!(player.set_tempo_rate(f64::NAN).is_err());
        assert_eq!(player.config().tempo_rate, 1.0);
    }

    #[test]
    fn load_sends_panic_and_init() {
        let mut player = TestPlayer::new(PlayerConfig::default());
        player.set_sink(Vec::new());
        player.load_smf(&song()).unwrap();
        let sent = player.sink().unwrap();
        assert_eq!(sent.len(), 1 + 16 + 16 * 7);
        assert_eq!(sent[1], vec![0xB0, 0x78, 0x00]);
        assert_eq!(sent[16], vec![0xBF, 0x78, 0x00]);
        assert_eq!(
            &sent[17..24],
            &[
                vec![0xB0, 0x07, 0x64],
                vec![0xB0, 0x0A, 0x40],
                vec![0xE0, 0x00, 0x40],
                vec![0xB0, 0x64, 0x00],
                vec![0xB0, 0x65, 0x00],
                vec![0xB0, 0x06, 0x02],
                vec![0xB0, 0x26, 0x00],
            ]
        );
        assert_eq!(player.sequence_name(), Some("Tune"));
    }

    #[test]
    fn plays_to_the_end() {
        let mut player = loaded();
        player.play(ms(1000)).unwrap();
        assert_eq!(player.transport(), Transport::Playing { due: ms(1000) });
        assert_eq!(player.advance(ms(1000)).unwrap(), Some(ms(500)));
        assert_eq!(player.advance(ms(1200)).unwrap(), Some(ms(300)));
        assert_eq!(player.position(), 2);
        assert_eq!(player.advance(ms(1500)).unwrap(), None);
        assert_eq!(player.transport(), Transport::Stopped);
        assert_eq!(
            player.sink().unwrap(),
            &vec![
                vec![0xFF, 0x03, 0x04, b'T', b'u', b'n', b'e'],
                vec![0x90, 0x3C, 0x40],
                vec![0x80, 0x3C, 0x00],
                vec![0xFF, 0x2F, 0x00],
            ]
        );

        //Playing again restarts from the beginning
        player.play(ms(2000)).unwrap();
        assert_eq!(player.position(), 0);
        assert_eq!(player.advance(ms(2000)).unwrap(), Some(ms(500)));
    }

    #[test]
    fn pause_resume_is_lossless() {
        let mut plain = loaded();
        plain.play(ms(0)).unwrap();
        let expected = plain.advance(ms(0)).unwrap();

        let mut paused = loaded();
        paused.play(ms(0)).unwrap();
        paused.pause(ms(0));
        paused.play(ms(0)).unwrap();
        assert_eq!(paused.advance(ms(0)).unwrap(), expected);
        assert_eq!(paused.state(), plain.state());

        paused.pause(ms(200));
        assert_eq!(paused.transport(), Transport::Paused { remaining: ms(300) });
        assert_eq!(paused.advance(ms(5000)).unwrap(), None);
        assert_eq!(paused.position(), 2);
        paused.play(ms(1000)).unwrap();
        assert_eq!(paused.advance(ms(1000)).unwrap(), Some(ms(300)));
    }

    #[test]
    fn stop_sends_panic() {
        let mut player = loaded();
        player.play(ms(0)).unwrap();
        player.advance(ms(0)).unwrap();
        player.sink_mut().unwrap().clear();
        player.stop(ms(100));
        assert_eq!(player.transport(), Transport::Paused { remaining: ms(400) });
        let sent = player.sink().unwrap();
        assert_eq!(sent.len(), 16);
        for (channel, msg) in sent.iter().enumerate() {
            assert_eq!(msg, &vec![0xB0 | channel as u8, 0x78, 0x00]);
        }
        assert_eq!(player.position(), 2);

        player.reset();
        assert_eq!(player.position(), 0);
        assert_eq!(player.transport(), Transport::Stopped);
    }

    #[test]
    fn failed_reload_keeps_state() {
        let mut player = loaded();
        player.play(ms(0)).unwrap();
        player.advance(ms(0)).unwrap();
        let before = player.timeline().cloned();
        let transport = player.transport();
        assert!(player.load_smf(b"garbage").is_err());
        assert!(player.load_mfi(b"melo").is_err());
        assert_eq!(player.timeline().cloned(), before);
        assert_eq!(player.transport(), transport);
        assert_eq!(player.position(), 2);
    }

    #[test]
    fn master_volume() {
        let mut player = TestPlayer::new(PlayerConfig::default());
        player.set_sink(Vec::new());
        player.set_master_volume(u14::new(0x1234));
        assert_eq!(player.master_volume(), u14::new(0x1234));
        assert_eq!(
            player.sink().unwrap(),
            &vec![
                vec![0xF0, 0x7F, 0x7F, 0x04, 0x01, 0x7F, 0x7F, 0xF7],
                vec![0xF0, 0x7F, 0x7F, 0x04, 0x01, 0x34, 0x24, 0xF7],
            ]
        );
    }

    #[test]
    fn empty_sequence_stays_stopped() {
        let mut player = TestPlayer::new(PlayerConfig::default());
        player.set_sink(Vec::new());
        player.load_smf(&smf_bytes(1, 96, &[&[]])).unwrap();
        player.play(ms(0)).unwrap();
        assert_eq!(player.transport(), Transport::Stopped);
        assert_eq!(player.advance(ms(0)).unwrap(), None);
    }

    #[test]
    fn late_wake_on_loop_jump() {
        let raw = smf_bytes(
            1,
            10,
            &[&[
                0x00, 0xFF, 0x06, 0x01, b'A', //
                0x0A, 0x90, 0x3C, 0x40, //
                0x0A, 0xFF, 0x06, 0x01, b'B', //
                0x0A, 0x80, 0x3C, 0x00, //
                0x00, 0xFF, 0x2F, 0x00,
            ]],
        );
        let mut player = TestPlayer::new(PlayerConfig::default());
        player.set_sink(Vec::new());
        player.set_marker_loop(true);
        player.load_smf(&raw).unwrap();
        player.play(ms(0)).unwrap();
        assert_eq!(player.advance(ms(0)).unwrap(), Some(ms(500)));
        assert_eq!(player.advance(ms(500)).unwrap(), Some(ms(500)));

        //`B` is due at 1000ms, the jump back to `A` keeps the note on schedule
        assert_eq!(player.advance(ms(1100)).unwrap(), Some(ms(400)));
        assert_eq!(player.transport(), Transport::Playing { due: ms(1500) });
        assert_eq!(player.position(), 1);
    }

    #[test]
    fn invalid_tempo_rate_is_replaced() {
        let config = PlayerConfig {
            tempo_rate: 0.0,
            ..PlayerConfig::default()
        };
        let mut player = TestPlayer::new(config);
        assert_eq!(player.config().tempo_rate, 1.0);
        player.set_sink(Vec::new());
        player.load_smf(&song()).unwrap();
        player.play(ms(0)).unwrap();
        assert_eq!(player.advance(ms(0)).unwrap(), Some(ms(500)));
    }

    #[test]
    fn loads_mfi() {
        let mut player = TestPlayer::new(PlayerConfig::default());
        player.set_sink(Vec::new());
        player.set_mfi_loop(true);
        player
            .load_mfi(&mfi_bytes(&[(b"copy", b"(c) me")], &[&[0x00, 0x0F, 48]]))
            .unwrap();
        assert_eq!(player.copyrights(), &["(c) me".to_string()]);
        assert_eq!(player.sequence_name(), None);
        assert_eq!(player.timeline().unwrap().len(), 4 + 15);
        assert!(player.config().loops.mfi_counted);
    }

    #[test]
    fn closure_sink() {
        let mut count = 0;
        {
            let mut player = Player::new(PlayerConfig::default());
            player.set_sink(|_msg: &[u8]| count += 1);
            player.load_smf(&song()).unwrap();
        }
        assert_eq!(count, 1 + 16 + 16 * 7);
    }
}
