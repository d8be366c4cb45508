//! Input buffer ownership tracking.
//!
//! The caller hands bytes to the decoder for the attach→release window and
//! gets the unconsumed tail back on release. Consumed bytes are never asked
//! for again; the tail must be resupplied verbatim (with more appended) on
//! the next attach.

use crate::error::UsageError;

#[derive(Debug, Default)]
pub(crate) struct InputBuffer {
    pub(crate) data: Vec<u8>,
    pub(crate) pos: usize,
    attached: bool,
    closed: bool,
}

impl InputBuffer {
    /// Attach bytes for the next parse window. On refusal the bytes are
    /// handed back; the tracker never frees caller data.
    pub(crate) fn set(&mut self, data: Vec<u8>) -> Result<(), (UsageError, Vec<u8>)> {
        if self.attached {
            return Err((UsageError::AlreadySet, data));
        }
        if self.closed {
            return Err((UsageError::InputClosed, data));
        }
        self.data = data;
        self.pos = 0;
        self.attached = true;
        Ok(())
    }

    /// Detach and return the unconsumed tail. Not an error on an empty
    /// attachment; returns an empty vec.
    pub(crate) fn release(&mut self) -> Vec<u8> {
        self.attached = false;
        let mut data = std::mem::take(&mut self.data);
        if self.pos > 0 {
            data.drain(..self.pos);
        }
        self.pos = 0;
        data
    }

    /// Mark that no further `set` calls will occur.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn available(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.data.len());
        self.pos += n;
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
        self.attached = false;
    }

    pub(crate) fn reopen(&mut self) {
        self.closed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_release_cycle() {
        let mut input = InputBuffer::default();
        input.set(vec![1, 2, 3, 4, 5]).unwrap();
        let (err, returned) = input.set(vec![9]).unwrap_err();
        assert_eq!(err, UsageError::AlreadySet);
        assert_eq!(returned, vec![9]);

        input.consume(3);
        assert_eq!(input.available(), &[4, 5]);
        assert_eq!(input.release(), vec![4, 5]);

        // Release on an empty attachment is not an error.
        assert_eq!(input.release(), Vec::<u8>::new());

        input.set(vec![4, 5, 6]).unwrap();
        assert_eq!(input.remaining(), 3);
    }

    #[test]
    fn close_rejects_further_input() {
        let mut input = InputBuffer::default();
        input.close();
        assert_eq!(input.set(vec![1]).unwrap_err().0, UsageError::InputClosed);
        assert!(input.is_closed());
    }
}
