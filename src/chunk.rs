//! Splitting of flash operations into transfer-sized chunks.
//!
//! Byte operations are split into chunks of at most `transfer_size` bytes,
//! erases into chunks of at most `transfer_size` sector indices. Chunks are
//! always issued in ascending order and nothing is rolled back: when chunk
//! `k` fails, chunks `0..k` have already been applied on the device.

use crate::protocol::Status;

/// One piece of a chunked operation
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Chunk {
    /// Position of this chunk in the operation
    pub index: usize,
    /// First byte offset, or first sector index for erases
    pub start: u32,
    /// Number of bytes or sectors covered
    pub len: usize,
}

/// Iterator over the chunks of an operation
#[derive(Debug, Clone)]
pub struct Chunks {
    start: u32,
    total: usize,
    size: usize,
    done: usize,
    index: usize,
}

impl Chunks {
    /// Chunks over `len` bytes starting at `offset`
    pub fn bytes(offset: u32, len: usize, size: usize) -> Self {
        Self::new(offset, len, size)
    }

    /// Chunks over `count` sectors starting at sector `first`
    pub fn sectors(first: u32, count: usize, size: usize) -> Self {
        Self::new(first, count, size)
    }

    // Callers bound `start + total` to the flash before chunking
    fn new(start: u32, total: usize, size: usize) -> Self {
        assert!(size > 0, "chunk size must be non-zero");
        Self { start, total, size, done: 0, index: 0 }
    }

    /// Total units (bytes or sectors) covered
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of chunks the operation splits into
    pub fn chunk_count(&self) -> usize {
        (self.total + self.size - 1) / self.size
    }

    /// Drive `step` over every chunk in order.
    ///
    /// `progress` is consulted after each completed chunk and may cancel
    /// the remaining ones.
    pub fn run<E, P, F>(self, progress: &mut P, mut step: F) -> Result<(), Halt<E>>
    where
        P: Progress + ?Sized,
        F: FnMut(Chunk) -> Result<Step, E>,
    {
        let total = self.total;
        let mut completed = 0;

        for chunk in self {
            match step(chunk) {
                Ok(Step::Continue) => (),
                Ok(Step::Stop(reason)) => {
                    return Err(Halt::Stopped(Stopped {
                        chunk: chunk.index,
                        start: chunk.start,
                        completed,
                        reason,
                    }))
                }
                Err(error) => {
                    return Err(Halt::Failed { chunk, completed, error });
                }
            }

            completed += chunk.len;

            if completed < total && progress.advance(completed, total) == Control::Cancel {
                return Err(Halt::Stopped(Stopped {
                    chunk: chunk.index + 1,
                    start: chunk.start + chunk.len as u32,
                    completed,
                    reason: StopReason::Cancelled,
                }));
            }
        }

        progress.advance(completed, total);

        Ok(())
    }
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done >= self.total {
            return None;
        }

        let len = core::cmp::min(self.size, self.total - self.done);
        let chunk = Chunk {
            index: self.index,
            start: self.start + self.done as u32,
            len,
        };

        self.done += len;
        self.index += 1;

        Some(chunk)
    }
}

/// What a step asks the chunk loop to do next
#[derive(Debug, PartialEq, Clone)]
pub enum Step {
    Continue,
    Stop(StopReason),
}

/// Why a chunked operation stopped early without an error
#[derive(Debug, PartialEq, Clone)]
pub enum StopReason {
    /// Device refused the chunk
    Rejected(Status),
    /// Read-back did not match what was written
    Mismatch,
    /// Progress hook asked to stop
    Cancelled,
}

/// Where and why a chunked operation stopped
#[derive(Debug, PartialEq, Clone)]
pub struct Stopped {
    /// Index of the first chunk not applied
    pub chunk: usize,
    /// First byte offset or sector index of that chunk
    pub start: u32,
    /// Bytes or sectors applied before it
    pub completed: usize,
    pub reason: StopReason,
}

/// Early end of a chunked operation
#[derive(Debug, PartialEq)]
pub enum Halt<E> {
    Stopped(Stopped),
    Failed { chunk: Chunk, completed: usize, error: E },
}

/// Result of a flash-mutating operation
#[derive(Debug, PartialEq, Clone)]
pub enum Outcome {
    Complete,
    Incomplete(Stopped),
}

impl Outcome {
    pub fn is_complete(&self) -> bool {
        *self == Outcome::Complete
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Control {
    Continue,
    Cancel,
}

/// Per-chunk progress and cancellation hook
pub trait Progress {
    /// Called after each chunk with units done so far and the total
    fn advance(&mut self, done: usize, total: usize) -> Control;
}

/// Progress hook that never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn advance(&mut self, _done: usize, _total: usize) -> Control {
        Control::Continue
    }
}

impl<F> Progress for F
where
    F: FnMut(usize, usize) -> Control,
{
    fn advance(&mut self, done: usize, total: usize) -> Control {
        self(done, total)
    }
}
