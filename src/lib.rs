//! # Overview
//!
//! `seqplay` decodes two binary music-sequence formats, Standard Midi Files (SMF, `.mid`) and
//! the chunked MFi/MLD ringtone format (`.mld`), into one timed event model, and drives a
//! tempo-aware, loop-aware playback scheduler over it.
//!
//! ```text
//! bytes ──► Smf::parse ──────────────────────────────┐
//! bytes ──► Mfi::parse ──► convert::to_smf ──► Smf::parse ──► Timeline ──► Scheduler ──► Sink
//! ```
//!
//! Both formats converge on the same representation: MFi files are translated into a
//! synthesized Standard Midi File, which is then parsed like any other.
//!
//! ```rust
//! use seqplay::{Smf, Timeline};
//!
//! let raw = [
//!     b'M', b'T', b'h', b'd', 0, 0, 0, 6, 0, 0, 0, 1, 0, 96,
//!     b'M', b'T', b'r', b'k', 0, 0, 0, 12,
//!     0x00, 0x90, 60, 100,
//!     0x60, 0x80, 60, 0,
//!     0x00, 0xFF, 0x2F, 0x00,
//! ];
//! let smf = Smf::parse(&raw).unwrap();
//! assert_eq!(smf.tracks[0].events.len(), 3);
//!
//! let timeline = Timeline::from_smf(smf);
//! for ev in timeline.events() {
//!     println!("{} {:?}", ev.time, ev.wire.as_bytes());
//! }
//! ```
//!
//! # Playback
//!
//! The [`Scheduler`](struct.Scheduler.html) is a pure state machine: each call to
//! `Scheduler::step` takes the current [`PlayerState`](struct.PlayerState.html) and returns the
//! next state, the wire messages to send right now and how long to wait before stepping again.
//! It never sleeps and never reads a clock.
//!
//! [`Player`](struct.Player.html) wraps the scheduler together with the loaded timeline, the
//! transport state (playing, paused, stopped) and a [`Sink`](trait.Sink.html) that receives
//! the wire messages.
//! The host supplies the timer, by calling `Player::advance` after the returned delay.
//!
//! # About features
//!
//! - The `std` feature (default) implements `std::error::Error` and enables the blocking
//!   `Player::run` loop. Without it the crate is `no_std + alloc`.
//! - The `parallel` feature (default) decodes the tracks of large files on several threads
//!   through `rayon`.
//! - The `strict` feature rejects files that are decodable but do not respect their format,
//!   raising `ErrorKind::Malformed` errors.
//! - The `serde` feature derives `Serialize` and `Deserialize` for the configuration types.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

macro_rules! bail {
    ($err:expr) => {{
        return Err($err.into());
    }};
}
macro_rules! ensure {
    ($cond:expr, $err:expr) => {{
        if !$cond {
            bail!($err)
        }
    }};
}

/// All of the errors this crate produces.
#[macro_use]
mod error;

mod prelude {
    pub(crate) use crate::{
        error::{ErrorKind, Result, ResultExt, StdResult},
        primitive::{u14, u15, u2, u24, u28, u4, u6, u7, IntRead, SplitChecked},
    };
    pub(crate) use alloc::{
        boxed::Box,
        collections::{BTreeMap, BinaryHeap},
        format,
        string::{String, ToString},
        vec,
        vec::Vec,
    };
    pub(crate) use core::{cmp::Reverse, convert::TryFrom, fmt, mem, ops, time::Duration};

    pub(crate) fn bit_range<T>(val: T, range: ops::Range<u32>) -> T
    where
        T: From<u8>
            + ops::Shr<u32, Output = T>
            + ops::Shl<u32, Output = T>
            + ops::Not<Output = T>
            + ops::BitAnd<Output = T>,
    {
        let mask = !((!T::from(0)) << (range.end - range.start));
        (val >> range.start) & mask
    }
}

pub mod chunk;
pub mod convert;
mod event;
mod merge;
pub mod mfi;
mod playback;
mod primitive;
mod smf;

pub use crate::{
    chunk::{Chunk, ChunkLayout, ChunkReader},
    convert::ConvertOptions,
    error::{Error, ErrorKind, Result},
    event::{ChannelMessage, EventKind, MetaMessage, TrackEvent, WireMessage},
    merge::{MergedEvent, Timeline},
    mfi::{Mfi, MfiInfo},
    playback::{
        Cycle, LoopConfig, LoopCount, LoopId, LoopMark, Next, Player, PlayerConfig, PlayerState,
        Scheduler, Sink, Transport,
    },
    primitive::{Format, Timing},
    smf::{write, Header, Smf, Track},
};

/// Exotically-sized integers used by the MIDI and MFi formats.
pub mod num {
    pub use crate::primitive::{u14, u15, u2, u24, u28, u4, u6, u7};
}

#[cfg(test)]
mod test;
