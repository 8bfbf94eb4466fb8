// ABOUTME: Push-based response sinks and the type-erased handler driving them
// ABOUTME: Guards the sink contract: exactly one terminal call, no items after it

use crate::codec::{CodecError, FrameReader};
use crate::error::{TransportError, TransportResult};
use std::marker::PhantomData;
use tokio::sync::oneshot;

/// Push-style observer for one request's streamed result.
///
/// Contract: any number of `next` calls followed by exactly one terminal
/// (`complete` or `error`), and nothing after the terminal. All calls are
/// made by the read pump task or by the closing path.
pub trait ResponseSink<T>: Send {
    fn next(&mut self, item: T);
    fn complete(&mut self);
    fn error(&mut self, err: TransportError);
}

/// Object-safe face of a pending request. The pumps only ever need two
/// verbs: feed it a response frame, or fail it.
pub(crate) trait ResponseHandler: Send {
    fn deliver(&mut self, reader: &mut FrameReader);
    fn fail(&mut self, err: TransportError);
}

/// Erases the per-request item type, pulling the caller's decode function
/// once per item and pushing through the sink.
///
/// The single-terminal invariant lives in the `terminated` flag: whichever
/// of completion, decode failure, or cancellation lands first wins, and
/// everything after is a no-op.
pub(crate) struct SinkHandler<T, D, S> {
    decode: D,
    sink: S,
    terminated: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T, D, S> SinkHandler<T, D, S> {
    pub fn new(decode: D, sink: S) -> Self {
        SinkHandler {
            decode,
            sink,
            terminated: false,
            _item: PhantomData,
        }
    }
}

impl<T, D, S> ResponseHandler for SinkHandler<T, D, S>
where
    D: FnMut(&mut FrameReader) -> Result<Option<T>, CodecError> + Send,
    S: ResponseSink<T>,
{
    fn deliver(&mut self, reader: &mut FrameReader) {
        if self.terminated {
            return;
        }
        loop {
            match (self.decode)(reader) {
                Ok(Some(item)) => self.sink.next(item),
                Ok(None) => {
                    self.terminated = true;
                    self.sink.complete();
                    return;
                }
                Err(err) => {
                    self.terminated = true;
                    self.sink.error(TransportError::Decoder(err));
                    return;
                }
            }
        }
    }

    fn fail(&mut self, err: TransportError) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.sink.error(err);
    }
}

/// Gathers every item and resolves a oneshot future at the terminal call.
///
/// Bridges the push contract back to request/response ergonomics; the
/// handshake runs on it, and callers that want a plain awaitable reply can
/// too.
pub struct CollectSink<T> {
    items: Vec<T>,
    reply: Option<oneshot::Sender<TransportResult<Vec<T>>>>,
}

impl<T> CollectSink<T> {
    /// Returns the sink and the future that resolves at its terminal.
    pub fn channel() -> (Self, oneshot::Receiver<TransportResult<Vec<T>>>) {
        let (tx, rx) = oneshot::channel();
        (
            CollectSink {
                items: Vec::new(),
                reply: Some(tx),
            },
            rx,
        )
    }
}

impl<T: Send> ResponseSink<T> for CollectSink<T> {
    fn next(&mut self, item: T) {
        self.items.push(item);
    }

    fn complete(&mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Ok(std::mem::take(&mut self.items)));
        }
    }

    fn error(&mut self, err: TransportError) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DIRECTION_RESPONSE, FrameHeader, Opcode, ProtocolVersion};
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    fn reader_with_body(body: &'static [u8]) -> FrameReader {
        let header = FrameHeader {
            version: DIRECTION_RESPONSE | ProtocolVersion::V2 as u8,
            flags: 0,
            stream: 0,
            opcode: Opcode::Result,
            length: body.len() as u32,
        };
        FrameReader::new(header, Bytes::from_static(body)).expect("frame")
    }

    #[derive(Clone, Default)]
    struct Record {
        items: Arc<Mutex<Vec<u8>>>,
        completions: Arc<Mutex<usize>>,
        errors: Arc<Mutex<Vec<TransportError>>>,
    }

    impl ResponseSink<u8> for Record {
        fn next(&mut self, item: u8) {
            self.items.lock().unwrap().push(item);
        }

        fn complete(&mut self) {
            *self.completions.lock().unwrap() += 1;
        }

        fn error(&mut self, err: TransportError) {
            self.errors.lock().unwrap().push(err);
        }
    }

    fn byte_decoder() -> impl FnMut(&mut FrameReader) -> Result<Option<u8>, CodecError> + Send {
        |reader: &mut FrameReader| {
            if reader.remaining() == 0 {
                return Ok(None);
            }
            reader.read_u8().map(Some)
        }
    }

    #[test]
    fn handler_streams_items_then_completes() {
        let record = Record::default();
        let mut handler = SinkHandler::new(byte_decoder(), record.clone());
        let mut reader = reader_with_body(&[1, 2, 3]);

        handler.deliver(&mut reader);

        assert_eq!(*record.items.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*record.completions.lock().unwrap(), 1);
        assert!(record.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn decode_error_is_the_only_terminal() {
        let record = Record::default();
        let mut decoded = 0;
        let decode = move |reader: &mut FrameReader| {
            decoded += 1;
            if decoded > 1 {
                return reader.read_i32().map(|_| None);
            }
            reader.read_u8().map(Some)
        };
        let mut handler = SinkHandler::new(decode, record.clone());
        let mut reader = reader_with_body(&[9]);

        handler.deliver(&mut reader);
        // A later cancellation must not produce a second terminal.
        handler.fail(TransportError::Cancelled);

        assert_eq!(*record.items.lock().unwrap(), vec![9]);
        assert_eq!(*record.completions.lock().unwrap(), 0);
        let errors = record.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], TransportError::Decoder(_)));
    }

    #[test]
    fn fail_after_complete_is_a_no_op() {
        let record = Record::default();
        let mut handler = SinkHandler::new(byte_decoder(), record.clone());
        let mut reader = reader_with_body(&[]);

        handler.deliver(&mut reader);
        handler.fail(TransportError::Cancelled);

        assert_eq!(*record.completions.lock().unwrap(), 1);
        assert!(record.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn collect_sink_resolves_items() {
        let (mut sink, reply) = CollectSink::channel();
        sink.next(1u8);
        sink.next(2);
        sink.complete();

        let items = reply.await.expect("terminal sent").expect("completed");
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn collect_sink_resolves_error() {
        let (mut sink, reply) = CollectSink::<u8>::channel();
        sink.next(1);
        sink.error(TransportError::Cancelled);

        let outcome = reply.await.expect("terminal sent");
        assert!(matches!(outcome, Err(TransportError::Cancelled)));
    }
}
