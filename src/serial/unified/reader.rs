//! Inbound path: bytes -> frames -> correlated replies or status pushes
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::types::{IoOrigin, LinkEvent, LinkShared};
use crate::serial::protocol::{FrameDecoder, Packet, StatusReport};

const READ_CHUNK: usize = 4096;

pub(crate) async fn reader_task<R>(
    mut port: R,
    shared: Arc<LinkShared>,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match port.read(&mut buf).await {
            Ok(0) => {
                report(&events, generation, "port closed".to_string());
                break;
            }
            Ok(n) => n,
            Err(e) => {
                report(&events, generation, e.to_string());
                break;
            }
        };

        let corrupt_before = decoder.corrupt_frames();
        let noise_before = decoder.noise_bytes();
        let packets = decoder.feed(&buf[..n]);
        let corrupt = decoder.corrupt_frames() - corrupt_before;
        let noise = decoder.noise_bytes() - noise_before;
        if corrupt > 0 || noise > 0 {
            let reason = (corrupt > 0)
                .then(|| decoder.last_error().map(|e| e.to_string()))
                .flatten();
            shared.update_metrics(|m| {
                m.corrupt_frames += corrupt;
                m.noise_bytes += noise;
                if reason.is_some() {
                    m.last_error = reason;
                }
            });
        }

        for packet in packets {
            route_packet(&shared, packet);
        }
    }

    log::debug!("Reader task for link generation {} finished", generation);
}

fn report(events: &mpsc::UnboundedSender<LinkEvent>, generation: u64, reason: String) {
    log::warn!("Serial read failed: {}", reason);
    let _ = events.send(LinkEvent::IoFailure {
        generation,
        origin: IoOrigin::Reader,
        reason,
    });
}

/// Deliver one decoded frame: to its pending request if the id is live,
/// otherwise into the status snapshot if it carries one, otherwise drop it.
pub(crate) fn route_packet(shared: &LinkShared, packet: Packet) {
    let response = match packet.response() {
        Ok(response) => response,
        Err(e) => {
            log::debug!("Undecodable payload ({}): {}", e, hex::encode(&packet.payload));
            shared.update_metrics(|m| {
                m.corrupt_frames += 1;
                m.last_error = Some(e.to_string());
            });
            return;
        }
    };
    shared.update_metrics(|m| m.frames_decoded += 1);

    let pending = response.id.and_then(|id| shared.pending.lock().take(id));
    if let Some(request) = pending {
        shared
            .status
            .send_modify(|status| status.apply_response(&request.command, &response));
        let latency_ms = request.started.elapsed().as_millis() as u64;
        shared.update_metrics(|m| m.record_latency(latency_ms));
        // the caller may have given up between take() and here
        let _ = request.responder.send(Ok(response));
        return;
    }

    if let Some(report) = response.status_report() {
        shared.status.send_modify(|status| status.apply_report(&report));
        shared.update_metrics(|m| m.status_pushes += 1);
        return;
    }

    if response.code != 0 {
        shared
            .status
            .send_modify(|status| status.record_fault(response.code, response.message()));
    }
    log::warn!(
        "Discarding orphan response id={:?} code={} (no pending request)",
        response.id,
        response.code
    );
    shared.update_metrics(|m| m.orphan_responses += 1);
}
