//! Device console
//!
//! The firmware prints its shell output as `SHELL_TO_PC` messages. The
//! console logger reassembles them into lines and forwards each line to the
//! `log` facade under the `device` target.

use std::sync::Arc;

use log::info;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::link::ConnectionManager;
use crate::protocols::apl::{Message, MessageId, ShellText};

/// Splits console text into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` and returns the lines it completed, without line
    /// terminators.
    pub fn push(&mut self, text: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(text));

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let rest = self.pending.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending, rest);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    /// Returns the unterminated tail, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Background task logging device console output. Stops when dropped.
pub struct ConsoleLogger {
    task: JoinHandle<()>,
}

impl ConsoleLogger {
    pub fn spawn(dispatcher: &Arc<Dispatcher>) -> Self {
        let mut output = dispatcher.subscribe(MessageId::ShellToPc);

        let task = tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            while let Some(frame) = output.next().await {
                for line in lines.push(frame.get(2..).unwrap_or_default()) {
                    info!(target: "device", "{}", line);
                }
            }
            if let Some(tail) = lines.flush() {
                info!(target: "device", "{}", tail);
            }
        });

        Self { task }
    }
}

impl Drop for ConsoleLogger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sends a line of text to the device shell.
pub async fn send_shell(manager: &ConnectionManager, text: &str) -> Result<()> {
    let connection = manager.current()?;
    let message = Message::ShellFromPc(ShellText::new(text.as_bytes().to_vec()));
    connection.send_message(&message).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"boot_enter(0xb00710ad): ").is_empty());
        assert_eq!(buffer.push(b"ok.\r\nWaiting"), vec!["boot_enter(0xb00710ad): ok."]);
        assert_eq!(buffer.push(b"\n\n"), vec!["Waiting", ""]);
        assert_eq!(buffer.flush(), None);

        buffer.push(b"tail");
        assert_eq!(buffer.flush().as_deref(), Some("tail"));
    }
}
