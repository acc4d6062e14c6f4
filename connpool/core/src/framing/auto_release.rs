//! Exactly-once release on body completion
//!
//! [`AutoReleaseReader`] owns a reader and a one-shot callback. Whichever
//! exit path fires first (end of input, `close`, `abort`, a read error, or
//! drop) hands the reader back through the callback, exactly once. Later
//! reads report end of input.

use std::fmt;
use std::io::{self, Read};

/// How a wrapped body ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseOutcome {
    /// End of input was reached by reading
    Completed,
    /// `close()` drained the rest of the body
    Closed,
    /// `abort()` gave up without draining
    Aborted,
    /// A read failed, or draining on close failed
    Failed,
    /// The handle was dropped before any other release
    Dropped,
}

impl ReleaseOutcome {
    /// Whether the underlying stream is positioned at a message boundary
    #[must_use]
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Completed | Self::Closed)
    }
}

impl fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Closed => write!(f, "closed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Failed => write!(f, "failed"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

type ReleaseFn<R> = Box<dyn FnOnce(R, ReleaseOutcome) + Send>;

/// Reader decorator that releases its source exactly once
pub struct AutoReleaseReader<R: Read> {
    inner: Option<R>,
    on_release: Option<ReleaseFn<R>>,
    outcome: Option<ReleaseOutcome>,
}

impl<R: Read> AutoReleaseReader<R> {
    /// Wrap `inner`; `on_release` receives it back when the body ends
    pub fn new<F>(inner: R, on_release: F) -> Self
    where
        F: FnOnce(R, ReleaseOutcome) + Send + 'static,
    {
        Self {
            inner: Some(inner),
            on_release: Some(Box::new(on_release)),
            outcome: None,
        }
    }

    /// Whether the release callback has run
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.outcome.is_some()
    }

    /// How the body ended, once released
    #[must_use]
    pub fn outcome(&self) -> Option<ReleaseOutcome> {
        self.outcome
    }

    /// Reference to the wrapped reader, until release
    pub fn get_ref(&self) -> Option<&R> {
        self.inner.as_ref()
    }

    /// Drain the rest of the body, then release
    ///
    /// # Errors
    ///
    /// The read error that stopped draining; the reader is released as
    /// `Failed` in that case.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(());
        };
        match io::copy(inner, &mut io::sink()) {
            Ok(_) => {
                self.release(ReleaseOutcome::Closed);
                Ok(())
            }
            Err(e) => {
                self.release(ReleaseOutcome::Failed);
                Err(e)
            }
        }
    }

    /// Release without draining
    pub fn abort(&mut self) {
        self.release(ReleaseOutcome::Aborted);
    }

    fn release(&mut self, outcome: ReleaseOutcome) {
        if let (Some(inner), Some(on_release)) = (self.inner.take(), self.on_release.take()) {
            self.outcome = Some(outcome);
            on_release(inner, outcome);
        }
    }
}

impl<R: Read> Read for AutoReleaseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(0);
        };
        match inner.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.release(ReleaseOutcome::Completed);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                Err(e)
            }
            Err(e) => {
                self.release(ReleaseOutcome::Failed);
                Err(e)
            }
        }
    }
}

impl<R: Read> Drop for AutoReleaseReader<R> {
    fn drop(&mut self) {
        self.release(ReleaseOutcome::Dropped);
    }
}

impl<R: Read> fmt::Debug for AutoReleaseReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoReleaseReader")
            .field("released", &self.is_released())
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}
