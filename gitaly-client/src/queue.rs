//! Turns pushed requests into the pull-based request stream of a
//! client-streaming or bidirectional call.

use futures_util::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("request queue is closed")]
pub struct QueueClosed;

/// Producer side. Cheap to share between tasks.
pub struct RequestQueue<T> {
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
}

/// Consumer side, handed to the transport as the request stream.
pub struct RequestStream<T> {
    receiver: mpsc::UnboundedReceiver<T>,
}

pub fn request_queue<T>() -> (RequestQueue<T>, RequestStream<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();

    (
        RequestQueue {
            sender: Mutex::new(Some(sender)),
        },
        RequestStream { receiver },
    )
}

impl<T> RequestQueue<T> {
    pub fn push(&self, request: T) -> Result<(), QueueClosed> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(QueueClosed);
        };

        sender.send(request).map_err(|_| QueueClosed)
    }

    /// Ends the stream once everything already pushed has been consumed.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_none_or(mpsc::UnboundedSender::is_closed)
    }
}

impl<T> Stream for RequestStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}
