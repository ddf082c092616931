//! Default message handler
//!
//! Prints every inbound message as two lines, `TOPIC: <topic>` then
//! `MSG: <payload>`, and mirrors it as a debug event. Failures to write are
//! swallowed; dispatching never affects the session.

use crate::protocol::messages::Message;
use crate::transport::mqtt::{MessageHandler, SharedHandler};
use std::io::{self, Stdout, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Writes received messages to a line-oriented sink, stdout by default
pub struct LoggingDispatcher<W = Stdout> {
    sink: Mutex<W>,
}

impl LoggingDispatcher<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl Default for LoggingDispatcher<Stdout> {
    fn default() -> Self {
        Self::stdout()
    }
}

impl<W: Write + Send> LoggingDispatcher<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_message(&self, message: &Message) -> io::Result<()> {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(sink, "TOPIC: {}", message.topic)?;
        writeln!(sink, "MSG: {}", message.payload_str())?;
        sink.flush()
    }
}

impl<W: Write + Send + 'static> LoggingDispatcher<W> {
    /// Wrap as the session's default handler
    pub fn into_shared(self) -> SharedHandler {
        Arc::new(self)
    }
}

impl<W: Write + Send> MessageHandler for LoggingDispatcher<W> {
    fn on_message(&self, message: &Message) {
        debug!(
            topic = %message.topic,
            payload = %message.payload_str(),
            qos = ?message.qos,
            retain = message.retain,
            "Message received"
        );

        if let Err(e) = self.write_message(message) {
            trace!("Dropping dispatcher output: {}", e);
        }
    }
}
