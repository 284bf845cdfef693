use std::collections::VecDeque;

use crate::error::RemoteError;

/// Incoming side of one stream.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    incoming: VecDeque<Vec<u8>>,
    /// The server sent its last packet.
    eof: bool,
    error: Option<RemoteError>,
}

impl StreamState {
    /// Queues a `CONTINUE` payload. An empty one marks the end of the data.
    pub(crate) fn push(&mut self, payload: Vec<u8>) {
        if payload.is_empty() {
            self.eof = true;
        } else {
            self.incoming.push_back(payload);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Vec<u8>> {
        self.incoming.pop_front()
    }

    pub(crate) fn finish(&mut self) {
        self.eof = true;
    }

    pub(crate) fn fail(&mut self, error: RemoteError) {
        self.eof = true;
        self.error = Some(error);
    }

    pub(crate) fn error(&self) -> Option<&RemoteError> {
        self.error.as_ref()
    }

    /// Returns `true` once the server sent its last packet.
    pub(crate) fn is_finished(&self) -> bool {
        self.eof
    }

    /// Returns `true` once the server is done and every packet was read.
    pub(crate) fn is_eof(&self) -> bool {
        self.eof && self.incoming.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.incoming.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_state() {
        let mut s = StreamState::default();
        s.push(vec![1]);
        s.push(vec![2, 2]);
        assert_eq!(s.queued(), 2);

        // EOF only shows once the queue is drained
        s.push(vec![]);
        assert!(!s.is_eof());
        assert_eq!(s.pop(), Some(vec![1]));
        assert_eq!(s.pop(), Some(vec![2, 2]));
        assert_eq!(s.pop(), None);
        assert!(s.is_eof());
    }
}
