use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info};

use crate::AppState;
use crate::broadcaster::{Frame, FrameBroadcaster};
use crate::error::AppError;

pub const BOUNDARY: &str = "FRAME";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One multipart chunk: boundary, part headers, the JPEG, trailing CRLF
pub fn encode_part(frame: &Frame) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    let mut buf = BytesMut::with_capacity(head.len() + frame.len() + 2);
    buf.extend_from_slice(head.as_bytes());
    buf.extend_from_slice(frame.bytes());
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// Per-client cursor over the broadcaster.
///
/// Dropping the session (the client went away, or the server is shutting
/// down) releases its viewer slot.
pub struct StreamSession {
    id: u64,
    broadcaster: Arc<FrameBroadcaster>,
    viewers: Arc<AtomicUsize>,
    last_seen: u64,
    sent: u64,
    started: Instant,
}

impl StreamSession {
    pub fn new(broadcaster: Arc<FrameBroadcaster>, viewers: Arc<AtomicUsize>) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let count = viewers.fetch_add(1, Ordering::SeqCst) + 1;
        info!(session = id, viewers = count, "stream client connected");
        Self {
            id,
            broadcaster,
            viewers,
            last_seen: 0,
            sent: 0,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent
    }

    /// Next multipart chunk. The first call returns the current frame right
    /// away when there is one; later calls wait for something newer.
    pub async fn next_part(&mut self) -> Bytes {
        let (frame, sequence) = match self.broadcaster.current_snapshot() {
            Some((frame, sequence)) if self.sent == 0 => (frame, sequence),
            _ => self.broadcaster.wait_next(self.last_seen).await,
        };
        if sequence > self.last_seen + 1 && self.sent > 0 {
            debug!(
                session = self.id,
                skipped = sequence - self.last_seen - 1,
                "client behind, skipping ahead"
            );
        }
        self.last_seen = sequence;
        self.sent += 1;
        encode_part(&frame)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let remaining = self.viewers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(
            session = self.id,
            frames = self.sent,
            secs = self.started.elapsed().as_secs(),
            viewers = remaining,
            "stream client disconnected"
        );
    }
}

pub async fn stream_handler(State(state): State<AppState>) -> Response {
    let mut session = StreamSession::new(state.broadcaster.clone(), state.viewers.clone());
    let mut shutdown = state.shutdown.subscribe();

    let body = async_stream::stream! {
        loop {
            let part = tokio::select! {
                part = session.next_part() => part,
                _ = shutdown.recv() => {
                    debug!(session = session.id(), "closing stream for shutdown");
                    break;
                }
            };
            yield Ok::<Bytes, Infallible>(part);
        }
    };

    let content_type = format!("multipart/x-mixed-replace; boundary={}", BOUNDARY);
    (
        [
            (header::CONTENT_TYPE, content_type.as_str()),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
            (header::AGE, "0"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

pub async fn snapshot_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    let (frame, _) = state
        .broadcaster
        .current_snapshot()
        .ok_or_else(|| AppError::not_ready("no frame received from the camera yet"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
        ],
        frame.bytes().clone(),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn part_payload(part: &Bytes) -> Vec<u8> {
        let text = part.as_ref();
        let start = text.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        text[start..text.len() - 2].to_vec()
    }

    #[test]
    fn test_encode_part_layout() {
        let part = encode_part(&Frame::new(Bytes::from_static(b"\xff\xd8abc\xff\xd9")));
        let expected = b"--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: 7\r\n\r\n\xff\xd8abc\xff\xd9\r\n";
        assert_eq!(part.as_ref(), &expected[..]);
    }

    #[tokio::test]
    async fn test_first_part_is_current_frame() {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        broadcaster.publish(Bytes::from_static(b"one"));
        broadcaster.publish(Bytes::from_static(b"two"));

        let mut session = StreamSession::new(broadcaster.clone(), Arc::new(AtomicUsize::new(0)));
        let part = session.next_part().await;
        assert_eq!(part_payload(&part), b"two");
        assert_eq!(session.last_seen(), 2);
    }

    #[tokio::test]
    async fn test_slow_session_skips_ahead() {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let mut session = StreamSession::new(broadcaster.clone(), Arc::new(AtomicUsize::new(0)));

        broadcaster.publish(Bytes::from_static(b"f1"));
        assert_eq!(part_payload(&session.next_part().await), b"f1");

        // Session is "busy" while three more frames arrive
        broadcaster.publish(Bytes::from_static(b"f2"));
        broadcaster.publish(Bytes::from_static(b"f3"));
        broadcaster.publish(Bytes::from_static(b"f4"));

        assert_eq!(part_payload(&session.next_part().await), b"f4");
        assert_eq!(session.last_seen(), 4);
        assert_eq!(session.frames_sent(), 2);

        // Nothing new: the session must not resend f4
        let again = tokio::time::timeout(Duration::from_millis(50), session.next_part()).await;
        assert!(again.is_err());
    }

    #[test]
    fn test_viewer_count_follows_sessions() {
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let viewers = Arc::new(AtomicUsize::new(0));

        let a = StreamSession::new(broadcaster.clone(), viewers.clone());
        let b = StreamSession::new(broadcaster.clone(), viewers.clone());
        assert_eq!(viewers.load(Ordering::SeqCst), 2);
        assert_ne!(a.id(), b.id());

        drop(a);
        assert_eq!(viewers.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(viewers.load(Ordering::SeqCst), 0);
    }
}
