//! Console frame sink.
//!
//! Implements [`FrameSink`] by writing every outbound subscription frame
//! to the logger (UART / USB-CDC in production).  It stands in for the
//! socket transport on bench units; a WebSocket adapter implements the
//! same trait.

use std::sync::atomic::{AtomicU32, Ordering};

use log::info;

use crate::app::ports::{FrameSink, SinkError};

/// Frames longer than this are cut in the log line (the count still
/// includes them).
const MAX_LOGGED: usize = 160;

#[derive(Default)]
pub struct LogFrameSink {
    sent: AtomicU32,
}

impl LogFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl FrameSink for LogFrameSink {
    fn send(&self, client: u32, frame: &str) -> Result<(), SinkError> {
        let mut end = frame.len().min(MAX_LOGGED);
        while !frame.is_char_boundary(end) {
            end -= 1;
        }
        let cut = if end < frame.len() { " ..." } else { "" };
        info!("FRAME | client={} | {}{}", client, &frame[..end], cut);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
