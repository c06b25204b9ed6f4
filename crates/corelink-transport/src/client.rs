//! Reconnecting WebSocket client channel.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use corelink_core::Frame;
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    backoff::{Backoff, ReconnectPolicy},
    protocol::ClientMessage,
};

const EVENT_QUEUE: usize = 256;
const SEND_QUEUE: usize = 64;

/// Client channel error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Channel is not open")]
    NotOpen,
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Lifecycle and data events from a client channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connected; the retry counter is back at zero.
    Opened,
    /// One inbound frame.
    Frame(Frame),
    /// Connection lost; the next attempt starts after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: retries exhausted or the channel was closed.
    Disconnected,
}

type OpenSender = Arc<Mutex<Option<mpsc::Sender<String>>>>;

/// Client side of one channel.
///
/// Messages sent while disconnected are dropped, not buffered. Dropping the
/// client closes it.
#[derive(Debug)]
pub struct ChannelClient {
    url: String,
    open: OpenSender,
    close_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl ChannelClient {
    /// Start connecting to `url`. Events arrive on the returned receiver
    /// until [`ChannelEvent::Disconnected`].
    #[must_use]
    pub fn connect(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let url = url.into();
        let open = OpenSender::default();
        let (close_tx, close_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let driver = tokio::spawn(drive(
            url.clone(),
            Backoff::new(policy),
            Arc::clone(&open),
            close_rx,
            events_tx,
        ));

        (
            Self {
                url,
                open,
                close_tx,
                driver,
            },
            events_rx,
        )
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the underlying connection is currently up.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.lock().is_ok_and(|open| open.is_some())
    }

    /// Send a message on the open connection.
    ///
    /// # Errors
    /// Returns [`ClientError::NotOpen`] if the channel is not connected; the
    /// message is dropped.
    pub fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let text = msg.to_json()?;
        let sender = self
            .open
            .lock()
            .ok()
            .and_then(|open| open.clone())
            .ok_or(ClientError::NotOpen)?;
        sender.try_send(text).map_err(|_| ClientError::NotOpen)
    }

    /// Close the channel and disable all future reconnects.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Whether the driver has stopped for good.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_open(open: &OpenSender, sender: Option<mpsc::Sender<String>>) {
    if let Ok(mut slot) = open.lock() {
        *slot = sender;
    }
}

async fn closed(close_rx: &mut watch::Receiver<bool>) {
    // A dropped client counts as closed.
    let _ = close_rx.wait_for(|closed| *closed).await;
}

async fn drive(
    url: String,
    mut backoff: Backoff,
    open: OpenSender,
    mut close_rx: watch::Receiver<bool>,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        let connected = tokio::select! {
            () = closed(&mut close_rx) => break,
            result = connect_async(url.as_str()) => result,
        };

        match connected {
            Ok((ws, _)) => {
                backoff.reset();
                tracing::info!(url = %url, "Channel opened");
                if events.send(ChannelEvent::Opened).await.is_err() {
                    break;
                }

                let (mut write, mut read) = ws.split();
                let (send_tx, mut send_rx) = mpsc::channel::<String>(SEND_QUEUE);
                set_open(&open, Some(send_tx));

                let mut deliberate = false;
                loop {
                    tokio::select! {
                        () = closed(&mut close_rx) => {
                            deliberate = true;
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                        Some(text) = send_rx.recv() => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                tracing::debug!(url = %url, "Send failed: {e}");
                                break;
                            }
                        }
                        msg = read.next() => {
                            let frame = match msg {
                                Some(Ok(Message::Text(text))) => Frame::from_wire(text.as_str()),
                                Some(Ok(Message::Binary(data))) => {
                                    Frame::from_wire(&String::from_utf8_lossy(&data))
                                }
                                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                Some(Ok(_)) => continue,
                            };
                            if events.send(ChannelEvent::Frame(frame)).await.is_err() {
                                deliberate = true;
                                break;
                            }
                        }
                    }
                }

                set_open(&open, None);
                if deliberate {
                    backoff.disable();
                    break;
                }
                tracing::warn!(url = %url, "Channel lost");
            }
            Err(e) => {
                tracing::warn!(url = %url, "Connect failed: {e}");
            }
        }

        let Some(delay) = backoff.next_delay() else {
            break;
        };
        let attempt = backoff.attempt();
        tracing::info!(url = %url, attempt, delay = ?delay, "Reconnecting");
        if events
            .send(ChannelEvent::Reconnecting { attempt, delay })
            .await
            .is_err()
        {
            break;
        }

        tokio::select! {
            () = closed(&mut close_rx) => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    set_open(&open, None);
    let _ = events.send(ChannelEvent::Disconnected).await;
}
