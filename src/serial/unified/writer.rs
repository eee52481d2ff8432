//! Outbound path: drains the request queue and drives the status poll
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::types::{IoOrigin, LinkEvent, LinkShared, OutboundFrame, RequestIds};
use crate::serial::protocol::{Command, Request};

pub(crate) struct WriterContext {
    pub shared: Arc<LinkShared>,
    pub ids: Arc<RequestIds>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub generation: u64,
    /// `None` disables the background status poll
    pub poll_interval: Option<Duration>,
}

pub(crate) async fn writer_task<W>(mut port: W, mut outbound: mpsc::Receiver<OutboundFrame>, ctx: WriterContext)
where
    W: AsyncWrite + Unpin,
{
    let mut poll = ctx.poll_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let frame = tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
            _ = async {
                match poll.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                // polls are fire-and-forget: the reply lands as a status push
                let id = ctx.ids.next();
                match Request::new(id, &Command::GetStatus).encode() {
                    Ok(bytes) => OutboundFrame { id, bytes },
                    Err(e) => {
                        log::error!("Failed to encode status poll: {}", e);
                        continue;
                    }
                }
            }
        };

        if let Err(e) = write_frame(&mut port, &frame.bytes).await {
            log::warn!("Serial write of request {} failed: {}", frame.id, e);
            ctx.shared.update_metrics(|m| m.last_error = Some(e.to_string()));
            let _ = ctx.events.send(LinkEvent::IoFailure {
                generation: ctx.generation,
                origin: IoOrigin::Writer,
                reason: e.to_string(),
            });
            break;
        }
        ctx.shared.update_metrics(|m| m.frames_written += 1);
    }

    log::debug!("Writer task for link generation {} finished", ctx.generation);
}

async fn write_frame<W: AsyncWrite + Unpin>(port: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    port.write_all(bytes).await?;
    port.flush().await
}
