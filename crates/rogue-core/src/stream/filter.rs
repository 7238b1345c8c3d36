//! Channel and error filter.

use tracing::trace;

use super::{
    frame::FramePtr,
    master::{AsMaster, Master},
    slave::Slave,
};
use crate::error::Result;

/// Forwards frames on one channel, optionally dropping errored frames.
#[derive(Debug, Default)]
pub struct Filter {
    master: Master,
    drop_errors: bool,
    channel: u8,
}

impl Filter {
    /// Pass frames with `channel`; with `drop_errors` also require `error == 0`.
    pub fn new(drop_errors: bool, channel: u8) -> Self {
        Self { master: Master::new(), drop_errors, channel }
    }
}

impl AsMaster for Filter {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for Filter {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let (channel, error) = {
            let lock = frame.lock();
            (lock.channel(), lock.error())
        };
        if channel != self.channel || (self.drop_errors && error != 0) {
            trace!(channel, error, "filter dropped frame");
            return Ok(());
        }
        self.master.send_frame(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::stream::{NullSlave, Pool, connect};

    fn frame(channel: u8, error: u8) -> FramePtr {
        let frame = Pool::new().accept_req(4, false, 0).unwrap();
        {
            let mut lock = frame.lock();
            lock.set_channel(channel);
            lock.set_error(error);
        }
        frame
    }

    #[test]
    fn passes_matching_channel_only() {
        let filter = Filter::new(true, 2);
        let sink = Arc::new(NullSlave::new());
        connect(&filter, sink.clone());

        filter.accept_frame(frame(2, 0)).unwrap();
        filter.accept_frame(frame(1, 0)).unwrap();
        filter.accept_frame(frame(2, 1)).unwrap();
        assert_eq!(sink.frame_count(), 1);
    }

    #[test]
    fn keeps_errors_when_asked() {
        let filter = Filter::new(false, 0);
        let sink = Arc::new(NullSlave::new());
        connect(&filter, sink.clone());

        filter.accept_frame(frame(0, 3)).unwrap();
        assert_eq!(sink.frame_count(), 1);
    }
}
