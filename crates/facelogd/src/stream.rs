//! MJPEG streaming: one dedicated capture thread per `/video_feed` client.

use crate::context::AppContext;
use crate::pipeline::FrameProcessor;
use axum::body::{Body, Bytes};
use facelog_hw::CameraSupervisor;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::convert::Infallible;
use tokio::sync::mpsc;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
/// Encoded frames buffered per client before the capture thread blocks.
const CHANNEL_CAPACITY: usize = 2;

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}

/// One multipart part: boundary line, part header, JPEG bytes, CRLF.
pub fn frame_chunk(jpeg: &[u8]) -> Bytes {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    Bytes::from(chunk)
}

/// Start a capture session and return the receiving end of its chunk stream.
///
/// The session ends, releasing its camera, when the client goes away, the
/// camera cannot be recovered, or the server shuts down.
pub fn spawn_session(ctx: &AppContext) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let supervisor = ctx.open_session();
    let processor = ctx.frame_processor();
    let quality = ctx.config.jpeg_quality;
    let session_ctx = ctx.clone();

    let spawned = std::thread::Builder::new()
        .name("facelog-stream".into())
        .spawn(move || run_session(supervisor, processor, quality, &session_ctx, tx));
    if let Err(e) = spawned {
        // The sender went down with the closure; the client sees an empty stream.
        tracing::error!(error = %e, "failed to spawn stream session thread");
    }
    rx
}

fn run_session(
    mut supervisor: CameraSupervisor,
    mut processor: FrameProcessor,
    quality: u8,
    ctx: &AppContext,
    tx: mpsc::Sender<Bytes>,
) {
    tracing::info!("stream session started");
    let mut sent = 0u64;

    while let Some(frame) = supervisor.next_frame() {
        if ctx.is_shutting_down() {
            tracing::info!("server shutting down; ending stream session");
            break;
        }
        let sequence = frame.sequence;
        let mut image = frame.image;
        let report = processor.process(&mut image);
        if !report.faces.is_empty() {
            tracing::debug!(
                sequence,
                faces = report.faces.len(),
                recorded = report.recorded(),
                "frame processed"
            );
        }

        let jpeg = match encode_jpeg(&image, quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(sequence, error = %e, "jpeg encode failed; frame skipped");
                continue;
            }
        };
        if tx.blocking_send(frame_chunk(&jpeg)).is_err() {
            tracing::info!(frames = sent, "stream client disconnected");
            break;
        }
        sent += 1;
    }

    supervisor.release();
    tracing::info!(frames = sent, state = ?supervisor.state(), "stream session ended");
}

/// Response body draining a session's chunk channel.
pub fn mjpeg_body(rx: mpsc::Receiver<Bytes>) -> Body {
    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    Body::from_stream(chunks)
}
