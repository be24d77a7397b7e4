//! Merging of the tracks of a file into a single timeline.

use crate::{
    event::{EventKind, MetaMessage, TrackEvent, WireMessage},
    prelude::*,
    primitive::{Format, Timing},
    smf::Smf,
};

/// An event of the merged timeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedEvent {
    /// Index of the track the event comes from.
    pub track: usize,
    /// Index of the event within its track.
    pub index: usize,
    /// Absolute time in ticks.
    pub time: u64,
    pub event: TrackEvent,
    /// The bytes to send for this event.
    pub wire: WireMessage,
}

/// All the events of a file in playback order, along with the file metadata needed for playback.
///
/// Events are ordered by `(time, track, index)`, which is a total order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeline {
    events: Vec<MergedEvent>,
    timing: Timing,
    format: Format,
    sequence_name: Option<String>,
    copyrights: Vec<String>,
}
impl Timeline {
    /// Merge the tracks of a decoded file.
    pub fn from_smf(smf: Smf) -> Timeline {
        let Smf { header, tracks } = smf;
        let sequence_name = match header.format {
            Format::SingleTrack => tracks.first().and_then(|track| {
                track.events.iter().find_map(|ev| match &ev.kind {
                    EventKind::Meta(MetaMessage::TrackName(name)) => Some(name.clone()),
                    _ => None,
                })
            }),
            _ => None,
        };
        let copyrights = tracks
            .iter()
            .flat_map(|track| track.events.iter())
            .filter_map(|ev| match &ev.kind {
                EventKind::Meta(MetaMessage::Copyright(text)) => Some(text.clone()),
                _ => None,
            })
            .collect();

        let total = tracks.iter().map(|track| track.len()).sum();
        let mut sources: Vec<_> = tracks
            .into_iter()
            .map(|track| track.events.into_iter().zip(track.wire).enumerate().peekable())
            .collect();
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (track_idx, source) in sources.iter_mut().enumerate() {
            if let Some((_, (ev, _))) = source.peek() {
                heap.push(Reverse((ev.time, track_idx)));
            }
        }
        let mut events = Vec::with_capacity(total);
        while let Some(Reverse((time, track_idx))) = heap.pop() {
            let source = &mut sources[track_idx];
            if let Some((index, (event, wire))) = source.next() {
                events.push(MergedEvent {
                    track: track_idx,
                    index,
                    time,
                    event,
                    wire,
                });
            }
            if let Some((_, (ev, _))) = source.peek() {
                heap.push(Reverse((ev.time, track_idx)));
            }
        }
        log::debug!(
            "merged {} tracks into a timeline of {} events, name {:?}",
            sources.len(),
            events.len(),
            sequence_name
        );
        Timeline {
            events,
            timing: header.timing,
            format: header.format,
            sequence_name,
            copyrights,
        }
    }

    /// All events, in playback order.
    pub fn events(&self) -> &[MergedEvent] {
        &self.events[..]
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// The name of the first track, only for single-track files.
    pub fn sequence_name(&self) -> Option<&str> {
        self.sequence_name.as_deref()
    }

    /// Every copyright notice, in track order.
    pub fn copyrights(&self) -> &[String] {
        &self.copyrights[..]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
