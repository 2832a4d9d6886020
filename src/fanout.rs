//! Bar fan-out: bridges the multiplexer's event stream to every delivery
//! target. The bar frame is serialized once and shared; sink failures never
//! reach back into the multiplexer.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::mux::Multiplexer;
use crate::prices::PriceLog;
use crate::protocol;
use crate::push::PushHandle;
use crate::types::MuxEvent;

pub fn spawn(
    mux: &Multiplexer,
    bars: broadcast::Sender<String>,
    push: Option<PushHandle>,
    prices: Option<PriceLog>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = mux.subscribe_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Ok(MuxEvent::Bar(bar)) => {
                        // No subscribers is fine; send only fails then.
                        let _ = bars.send(protocol::bar_frame(&bar));
                        if let Some(push) = &push {
                            push.enqueue(&bar);
                        }
                        if let Some(prices) = &prices {
                            prices.record(&bar);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("fan-out lagged {n} multiplexer events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
