//! Push-style view of a cursor.

use crate::cursor::{Cursor, CursorPhase, DocumentTransform};
use crate::error::ClientError;
use docwire_protocol::Document;
use futures::stream::{self, BoxStream, Stream};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A [`Stream`] of documents read from a [`Cursor`].
///
/// The stream ends when the cursor is exhausted or closed. A fetch error is
/// yielded once and ends the stream.
pub struct CursorStream {
    inner: BoxStream<'static, Result<Document, ClientError>>,
}

impl CursorStream {
    pub(crate) fn new(cursor: Cursor, transform: Option<DocumentTransform>) -> Self {
        let inner = stream::unfold(Some(cursor), move |cursor| {
            let transform = transform.clone();
            async move {
                let mut cursor = cursor?;
                let next = match cursor.take_current() {
                    Some(doc) => Ok(Some(doc)),
                    None if cursor.phase() == CursorPhase::Closed || cursor.is_closed() => {
                        return None;
                    }
                    None => cursor
                        .fetch_next()
                        .await
                        .map(|doc| doc.map(|doc| cursor.apply_transforms(doc))),
                };
                match next {
                    Ok(Some(doc)) => {
                        let doc = match transform {
                            Some(ref transform) => transform(doc),
                            None => doc,
                        };
                        Some((Ok(doc), Some(cursor)))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        tracing::debug!("cursor stream ended with error: {}", e);
                        Some((Err(e), None))
                    }
                }
            }
        });
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for CursorStream {
    type Item = Result<Document, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
