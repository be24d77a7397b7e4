use core::fmt;

/// Debug builds remember every context an error was wrapped in.
#[cfg(debug_assertions)]
mod repr {
    use super::{Error, ErrorKind, ErrorRepr};
    use alloc::boxed::Box;

    pub type Inner = Box<Frame>;

    #[derive(Clone, Debug)]
    pub struct Frame {
        kind: &'static ErrorKind,
        cause: Option<Error>,
    }

    #[inline]
    pub fn leaf(kind: &'static ErrorKind) -> Inner {
        Box::new(Frame { kind, cause: None })
    }

    impl ErrorRepr for Error {
        #[inline]
        fn kind(&self) -> ErrorKind {
            *self.inner.kind
        }
        #[inline]
        fn cause(&self) -> Option<&Error> {
            self.inner.cause.as_ref()
        }
        #[inline]
        fn wrap(self, outer: &'static ErrorKind) -> Error {
            Error {
                inner: Box::new(Frame {
                    kind: outer,
                    cause: Some(self),
                }),
            }
        }
    }
}

/// Release builds only keep the outermost kind.
#[cfg(not(debug_assertions))]
mod repr {
    use super::{Error, ErrorKind, ErrorRepr};

    pub type Inner = &'static ErrorKind;

    #[inline]
    pub fn leaf(kind: &'static ErrorKind) -> Inner {
        kind
    }

    impl ErrorRepr for Error {
        #[inline]
        fn kind(&self) -> ErrorKind {
            *self.inner
        }
        #[inline]
        fn cause(&self) -> Option<&Error> {
            None
        }
        #[inline]
        fn wrap(self, outer: &'static ErrorKind) -> Error {
            Error { inner: outer }
        }
    }
}

trait ErrorRepr {
    fn kind(&self) -> ErrorKind;
    fn cause(&self) -> Option<&Error>;
    fn wrap(self, outer: &'static ErrorKind) -> Error;
}

/// Why loading a sequence or driving the player failed.
///
/// Loading errors carry the stage that failed (chunk, track, record) wrapped around the byte
/// level problem. The wrapping is only recorded in debug builds: in release builds the error is
/// a single pointer to the outermost `ErrorKind`, and `Error::source` returns `None`.
///
/// With the `std` feature this type implements `std::error::Error`.
#[derive(Clone)]
pub struct Error {
    inner: repr::Inner,
}
impl Error {
    #[inline]
    pub fn new(kind: &'static ErrorKind) -> Error {
        Error::from(kind)
    }

    /// What went wrong at this level.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        ErrorRepr::kind(self)
    }

    /// The error this one wraps, if any. Release builds never have one.
    #[inline]
    pub fn source(&self) -> Option<&Error> {
        ErrorRepr::cause(self)
    }

    /// Follow `source` down to the error that started it all.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Some(cause) = err.source() {
            err = cause;
        }
        err
    }
}
impl From<&'static ErrorKind> for Error {
    #[inline]
    fn from(kind: &'static ErrorKind) -> Error {
        Error {
            inner: repr::leaf(kind),
        }
    }
}
impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)?;
        let mut cause = self.source();
        while let Some(err) = cause {
            write!(f, "\n  from {}", err.kind())?;
            cause = err.source();
        }
        Ok(())
    }
}
#[cfg(feature = "std")]
impl std::error::Error for Error {
    #[inline]
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Error::source(self).map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// The class of an error, with a fixed description.
///
/// Loading a given file always fails the same way, so retrying is pointless.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The bytes are not a sequence this crate can read: a wrong signature, a chunk or record cut
    /// short, an unterminated SysEx, a data byte where a status byte should be or a broken MFi
    /// constant.
    ///
    /// Nothing is loaded.
    Invalid(&'static str),

    /// The sequence is readable but breaks the rules of its format, for example a header chunk
    /// that is longer than it should be.
    ///
    /// Raised only with the `strict` feature. Lenient builds log a warning and go on.
    Malformed(&'static str),

    /// An MFi record with a code this crate does not know.
    ///
    /// Its length cannot be inferred, so the rest of the track cannot be read either.
    Unsupported(&'static str),

    /// A player call made at the wrong time, like playing with nothing loaded.
    ///
    /// The player is left as it was.
    Precondition(&'static str),
}
impl ErrorKind {
    /// The description carried by the kind, without the class prefix.
    #[inline]
    pub fn message(&self) -> &'static str {
        match *self {
            ErrorKind::Invalid(msg)
            | ErrorKind::Malformed(msg)
            | ErrorKind::Unsupported(msg)
            | ErrorKind::Precondition(msg) => msg,
        }
    }
}
impl fmt::Display for ErrorKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let class = match self {
            ErrorKind::Invalid(_) => "invalid sequence",
            ErrorKind::Malformed(_) => "malformed sequence",
            ErrorKind::Unsupported(_) => "unsupported message",
            ErrorKind::Precondition(_) => "player not ready",
        };
        write!(f, "{}: {}", class, self.message())
    }
}

/// A `&'static ErrorKind` built at compile time.
macro_rules! static_kind {
    ($class:ident, $msg:expr) => {{
        const KIND: &'static ErrorKind = &ErrorKind::$class($msg);
        KIND
    }};
}
macro_rules! err_invalid {
    ($msg:expr) => {
        static_kind!(Invalid, $msg)
    };
}
macro_rules! err_malformed {
    ($msg:expr) => {
        static_kind!(Malformed, $msg)
    };
}
macro_rules! err_unsupported {
    ($msg:expr) => {
        static_kind!(Unsupported, $msg)
    };
}
macro_rules! err_precondition {
    ($msg:expr) => {
        static_kind!(Precondition, $msg)
    };
}

/// Wrap a failure in the stage it happened in.
pub(crate) trait ResultExt<T> {
    fn context(self, stage: &'static ErrorKind) -> StdResult<T, Error>;
}
impl<T> ResultExt<T> for StdResult<T, Error> {
    #[inline]
    fn context(self, stage: &'static ErrorKind) -> StdResult<T, Error> {
        self.map_err(|err| err.wrap(stage))
    }
}
impl<T> ResultExt<T> for StdResult<T, &'static ErrorKind> {
    #[inline]
    fn context(self, stage: &'static ErrorKind) -> StdResult<T, Error> {
        self.map_err(|kind| Error::from(kind).wrap(stage))
    }
}

pub type Result<T> = StdResult<T, Error>;
pub(crate) use core::result::Result as StdResult;
