//! Specific to the SMF packaging of MIDI streams.

use crate::{
    chunk::{self, ChunkLayout, ChunkReader},
    event::{TrackEvent, WireMessage},
    prelude::*,
    primitive::{Format, Timing},
};

/// How many bytes of track data make multithreaded parsing worthwhile.
#[cfg(feature = "parallel")]
const PARALLEL_ENABLE_THRESHOLD: usize = 3 * 1024;

/// A decoded Standard Midi File.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Smf {
    pub header: Header,
    pub tracks: Vec<Track>,
}
impl Smf {
    pub fn new(header: Header, tracks: Vec<Track>) -> Smf {
        Smf { header, tracks }
    }

    /// Decode a Standard Midi File, or an RMID file wrapping one.
    ///
    /// Any error aborts the whole parse, no track is skipped.
    pub fn parse(raw: &[u8]) -> Result<Smf> {
        let raw = if raw.starts_with(b"RIFF") {
            chunk::unwrap_rmid(raw)?
        } else {
            raw
        };
        let mut chunks = ChunkReader::new(raw, ChunkLayout::SMF);
        chunks.parse(Some(1))?;
        let header_chunk = *chunks.get(0).context(err_invalid!("no header chunk"))?;
        ensure!(
            &header_chunk.id == b"MThd",
            err_invalid!("invalid header signature")
        );
        let (header, track_count) = Header::read(chunks.data(&header_chunk))
            .context(err_invalid!("invalid midi header"))?;

        let track_count = track_count as usize;
        chunks.parse(Some(1 + track_count))?;
        let mut bodies = Vec::with_capacity(track_count);
        for idx in 1..=track_count {
            let chunk = *chunks.get(idx).context(err_invalid!("missing track chunk"))?;
            ensure!(&chunk.id == b"MTrk", err_invalid!("invalid track signature"));
            bodies.push(chunks.data(&chunk));
        }
        if cfg!(feature = "strict") {
            chunks.parse(None)?;
            ensure!(
                chunks.chunks()[1 + track_count..]
                    .iter()
                    .all(|chunk| &chunk.id != b"MTrk"),
                err_malformed!("file has a different amount of tracks than declared")
            );
            ensure!(
                header.format != Format::SingleTrack || track_count == 1,
                err_malformed!("singletrack format file has multiple tracks")
            );
        }

        let tracks = decode_tracks(bodies)?;
        log::debug!(
            "parsed smf: {:?}, {:?}, {} tracks, {} events",
            header.format,
            header.timing,
            tracks.len(),
            tracks.iter().map(|t| t.events.len()).sum::<usize>()
        );
        Ok(Smf { header, tracks })
    }

    /// Encode this file into a byte buffer.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        write(&self.header, self.tracks.iter().map(|t| t.events.iter()), out)
    }

    /// Encode this file into a new byte buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16 * 1024);
        self.write(&mut out)?;
        Ok(out)
    }
}

fn decode_tracks(bodies: Vec<&[u8]>) -> Result<Vec<Track>> {
    //Attempt to use multiple threads if possible and enabled
    #[cfg(feature = "parallel")]
    {
        let total: usize = bodies.iter().map(|body| body.len()).sum();
        if total >= PARALLEL_ENABLE_THRESHOLD {
            use rayon::prelude::*;
            return bodies.into_par_iter().map(Track::read).collect();
        }
    }
    //Fall back to single-threaded
    bodies.into_iter().map(Track::read).collect()
}

/// Encode and write a MIDI file into the given buffer.
///
/// Channel messages are written using running status.
/// Fails if there are more than 65535 tracks or a chunk is over 4GB.
pub fn write<'a, T>(
    header: &Header,
    tracks: impl ExactSizeIterator<Item = T>,
    out: &mut Vec<u8>,
) -> Result<()>
where
    T: IntoIterator<Item = &'a TrackEvent>,
{
    let track_count =
        u16::try_from(tracks.len()).map_err(|_| err_invalid!("track count exceeds 16 bit range"))?;
    out.extend_from_slice(b"MThd");
    out.extend_from_slice(&6u32.to_be_bytes());
    out.extend_from_slice(&header.encode(track_count));
    for track in tracks {
        write_track(track, out)?;
    }
    Ok(())
}

/// Write a track chunk, back-patching its length.
fn write_track<'a>(track: impl IntoIterator<Item = &'a TrackEvent>, out: &mut Vec<u8>) -> Result<()> {
    let start = out.len();
    out.extend_from_slice(b"MTrk\0\0\0\0");
    let mut running_status = None;
    for ev in track {
        ev.write(&mut running_status, out)?;
    }
    let len = u32::try_from(out.len() - start - 8)
        .map_err(|_| err_invalid!("midi chunk size exceeds 32 bit range"))?;
    out[start + 4..start + 8].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// A MIDI file header.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Header {
    pub format: Format,
    pub timing: Timing,
}
impl Header {
    pub fn new(format: Format, timing: Timing) -> Header {
        Header { format, timing }
    }

    /// Read both the header and the track count.
    fn read(mut raw: &[u8]) -> Result<(Header, u16)> {
        let format = Format::read(&mut raw)?;
        let track_count = u16::read(&mut raw)?;
        let timing = Timing::read(&mut raw)?;
        Ok((Header::new(format, timing), track_count))
    }

    fn encode(&self, track_count: u16) -> [u8; 6] {
        let mut bytes = [0; 6];
        bytes[0..2].copy_from_slice(&self.format.encode()[..]);
        bytes[2..4].copy_from_slice(&track_count.to_be_bytes()[..]);
        bytes[4..6].copy_from_slice(&self.timing.encode()[..]);
        bytes
    }
}

/// A decoded track: its events and, for each event, the bytes to send to a receiver.
///
/// `events` and `wire` always have the same length.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Track {
    pub events: Vec<TrackEvent>,
    pub wire: Vec<WireMessage>,
}
impl Track {
    /// Build a track out of events, deriving absolute times from the deltas and the wire
    /// messages from the events themselves.
    pub fn from_events(mut events: Vec<TrackEvent>) -> Track {
        let mut time = 0;
        for ev in events.iter_mut() {
            time += u64::from(ev.delta.as_int());
            ev.time = time;
        }
        let wire = events.iter().map(|ev| ev.kind.wire()).collect();
        Track { events, wire }
    }

    fn read(mut raw: &[u8]) -> Result<Track> {
        let mut events = Vec::with_capacity(raw.len() / 3);
        let mut wire = Vec::with_capacity(raw.len() / 3);
        let mut running_status = None;
        let mut time = 0;
        while !raw.is_empty() {
            let (ev, bytes) = TrackEvent::read(&mut raw, &mut running_status, time)
                .context(err_invalid!("failed to parse event"))?;
            time = ev.time;
            events.push(ev);
            wire.push(bytes);
        }
        Ok(Track { events, wire })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
