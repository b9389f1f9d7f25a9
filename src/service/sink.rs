// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::network::Message;
use crate::{AppError, AppResult};

/// Consumer of decoded inbound messages, registered once per connector.
pub trait MessageSink: Send + Sync + 'static {
    fn receive(&self, message: Message);
}

impl<F> MessageSink for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn receive(&self, message: Message) {
        self(message)
    }
}

/// Hands decoded messages from the I/O workers to the sink.
///
/// Messages go through a bounded channel drained by one dedicated thread, so
/// a slow sink slows the readers down instead of occupying runtime workers.
/// The thread exits once every dispatcher clone is dropped and the channel
/// has been drained.
#[derive(Debug, Clone)]
pub struct SinkDispatcher {
    message_tx: async_channel::Sender<Message>,
}

impl SinkDispatcher {
    pub fn start(name: &str, sink: Arc<dyn MessageSink>, capacity: usize) -> AppResult<Self> {
        if capacity == 0 {
            return Err(AppError::InvalidValue(format!(
                "{} sink channel capacity must be greater than 0",
                name
            )));
        }
        let (message_tx, message_rx) = async_channel::bounded::<Message>(capacity);
        let thread_name = format!("{}-sink", name);
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("{} started", thread_name);
                while let Ok(message) = message_rx.recv_blocking() {
                    let remote_address = message.remote_address();
                    if let Err(payload) =
                        panic::catch_unwind(AssertUnwindSafe(|| sink.receive(message)))
                    {
                        error!(
                            "message sink panicked on message from {}: {}",
                            remote_address,
                            panic_message(payload.as_ref())
                        );
                    }
                }
                debug!("{} exited", thread_name);
            })?;
        Ok(SinkDispatcher { message_tx })
    }

    /// Queues one message for the sink, waiting while the queue is full.
    pub async fn dispatch(&self, message: Message) -> AppResult<()> {
        self.message_tx
            .send(message)
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
