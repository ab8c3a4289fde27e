//! Ordered buffering of frames that arrive while a connection is between
//! stages (handshake done, upstream not spliced yet).

use std::collections::VecDeque;
use std::convert::Infallible;

/// A stage that can accept frames replayed from a [`DataBacklog`].
pub trait FrameSink<T> {
    type Error;

    /// Deliver one frame.
    fn on_data(&mut self, frame: T) -> Result<(), Self::Error>;

    /// A batch of frames has been delivered.
    fn on_read_complete(&mut self) -> Result<(), Self::Error>;
}

/// FIFO queue of inbound frames owned by a single handler.
///
/// Frames leave the backlog exactly once, in the order they were added.
#[derive(Debug)]
pub struct DataBacklog<T> {
    pending: VecDeque<T>,
}

impl<T> DataBacklog<T> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    pub fn add(&mut self, frame: T) {
        self.pending.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain every queued frame into `sink`, then signal read-complete.
    ///
    /// Nothing is signalled when the backlog was empty. If the sink fails,
    /// the frames it has not seen stay queued.
    pub fn flush<S>(&mut self, sink: &mut S) -> Result<(), S::Error>
    where
        S: FrameSink<T>,
    {
        let had_pending = !self.pending.is_empty();

        while let Some(frame) = self.pending.pop_front() {
            sink.on_data(frame)?;
        }

        if had_pending {
            sink.on_read_complete()?;
        }
        Ok(())
    }
}

impl<T> Default for DataBacklog<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects replayed frames in order.
impl<T> FrameSink<T> for Vec<T> {
    type Error = Infallible;

    fn on_data(&mut self, frame: T) -> Result<(), Infallible> {
        self.push(frame);
        Ok(())
    }

    fn on_read_complete(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        Data(u32),
        ReadComplete,
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
        fail_on: Option<u32>,
    }

    impl FrameSink<u32> for Recorder {
        type Error = u32;

        fn on_data(&mut self, frame: u32) -> Result<(), u32> {
            if self.fail_on == Some(frame) {
                return Err(frame);
            }
            self.events.push(Event::Data(frame));
            Ok(())
        }

        fn on_read_complete(&mut self) -> Result<(), u32> {
            self.events.push(Event::ReadComplete);
            Ok(())
        }
    }

    #[test]
    fn flush_preserves_insertion_order() {
        let mut backlog = DataBacklog::new();
        for frame in [3, 1, 2] {
            backlog.add(frame);
        }

        let mut sink = Recorder::default();
        backlog.flush(&mut sink).unwrap();

        assert_eq!(
            sink.events,
            vec![Event::Data(3), Event::Data(1), Event::Data(2), Event::ReadComplete]
        );
        assert!(backlog.is_empty());
    }

    #[test]
    fn empty_flush_is_silent() {
        let mut backlog: DataBacklog<u32> = DataBacklog::new();
        let mut sink = Recorder::default();
        backlog.flush(&mut sink).unwrap();
        assert!(sink.events.is_empty());
    }

    #[test]
    fn frames_are_delivered_once() {
        let mut backlog = DataBacklog::new();
        backlog.add(7);

        let mut sink = Recorder::default();
        backlog.flush(&mut sink).unwrap();
        backlog.flush(&mut sink).unwrap();

        assert_eq!(sink.events, vec![Event::Data(7), Event::ReadComplete]);
    }

    #[test]
    fn failed_delivery_keeps_the_rest_queued() {
        let mut backlog = DataBacklog::new();
        for frame in [1, 2, 3] {
            backlog.add(frame);
        }

        let mut sink = Recorder {
            fail_on: Some(2),
            ..Default::default()
        };
        assert_eq!(backlog.flush(&mut sink), Err(2));
        assert_eq!(sink.events, vec![Event::Data(1)]);
        assert_eq!(backlog.len(), 1);
    }
}
