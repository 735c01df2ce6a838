//! # Console subsystem
//!
//! The Crazyflie has a text console that is used to communicate various information
//! and debug message to the ground.

use std::sync::Arc;

use crate::crtp::Packet;
use async_broadcast::{broadcast, Receiver};
use flume as channel;
use futures::{lock::Mutex, Stream, StreamExt};
use tokio::task::JoinHandle;

/// # Access to the console subsystem
///
/// See the [console module documentation](crate::subsystems::console) for more context and information.
pub struct Console {
    stream_broadcast_receiver: Receiver<String>,
    console_buffer: Arc<Mutex<String>>,
    line_broadcast_receiver: Receiver<String>,
    console_lines: Arc<Mutex<Vec<String>>>,
    console_task: JoinHandle<()>,
}

impl Console {
    pub(crate) fn new(downlink: channel::Receiver<Packet>) -> Self {
        let (mut stream_broadcast, stream_broadcast_receiver) = broadcast(1000);
        let (mut line_broadcast, line_broadcast_receiver) = broadcast(1000);
        // Slow readers lose the oldest text instead of blocking the console
        stream_broadcast.set_overflow(true);
        line_broadcast.set_overflow(true);

        let console_buffer: Arc<Mutex<String>> = Default::default();
        let console_lines: Arc<Mutex<Vec<String>>> = Default::default();

        let buffer = console_buffer.clone();
        let lines = console_lines.clone();

        let console_task = tokio::spawn(async move {
            let mut line_buffer = String::new();
            while let Ok(pk) = downlink.recv_async().await {
                let text = String::from_utf8_lossy(pk.get_data()).into_owned();

                // History and broadcast are updated together so that a new
                // stream neither misses nor duplicates text
                {
                    let mut buffer = buffer.lock().await;
                    buffer.push_str(&text);
                    let _ = stream_broadcast.broadcast(text.clone()).await;
                }

                line_buffer.push_str(&text);
                while let Some((line, rest)) = line_buffer.split_once('\n') {
                    let line = line.to_owned();
                    line_buffer = rest.to_owned();

                    let mut lines = lines.lock().await;
                    lines.push(line.clone());
                    let _ = line_broadcast.broadcast(line).await;
                }
            }
        });

        Self {
            stream_broadcast_receiver,
            console_buffer,
            line_broadcast_receiver,
            console_lines,
            console_task,
        }
    }

    /// Stream of console text, starting with all the text received so far
    pub async fn get_stream(&self) -> impl Stream<Item = String> {
        let buffer = self.console_buffer.lock().await;
        let history_stream = futures::stream::once(futures::future::ready(buffer.clone())).boxed();

        history_stream.chain(self.stream_broadcast_receiver.new_receiver())
    }

    /// Stream of console text received from now on
    pub async fn get_stream_no_history(&self) -> impl Stream<Item = String> {
        self.stream_broadcast_receiver.new_receiver()
    }

    /// Stream of console lines, starting with all the lines received so far
    pub async fn get_line_stream(&self) -> impl Stream<Item = String> {
        let lines = self.console_lines.lock().await;
        let history_stream = futures::stream::iter(lines.clone()).boxed();

        history_stream.chain(self.line_broadcast_receiver.new_receiver())
    }

    /// Stream of console lines received from now on
    pub async fn get_line_stream_no_history(&self) -> impl Stream<Item = String> {
        self.line_broadcast_receiver.new_receiver()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.console_task.abort();
    }
}
