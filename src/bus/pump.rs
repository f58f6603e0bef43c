//! Consumer pump: broker stream → bounded inbound channel.
//!
//! When the stream ends or the broker reports a connection error, the pump
//! re-subscribes with exponential backoff and re-creates every active
//! binding. Unsettled deliveries of the lost connection are redelivered by
//! the broker.

use std::sync::Arc;

use backon::BackoffBuilder;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::saga::DelayedSubscriptions;
use crate::utils::retry::{reconnect_backoff, RECONNECT_MAX_DELAY};

pub(crate) struct Pump {
    pub broker: Arc<dyn Broker>,
    pub queue: String,
    pub subscriptions: Arc<DelayedSubscriptions>,
    pub inbound: mpsc::Sender<Delivery>,
}

enum StreamEnd {
    Stopped,
    Disconnected,
}

impl Pump {
    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) {
        let backoff_builder = reconnect_backoff();
        let mut backoff = backoff_builder.build();
        let mut reconnecting = false;

        loop {
            if *stop.borrow() {
                break;
            }

            if reconnecting {
                if let Err(e) = self.subscriptions.rebind_all().await {
                    warn!(error = %e, queue = %self.queue, "Failed to restore bindings");
                }
            }

            let mut errors = self.broker.connection_errors();
            match self.broker.consume(&self.queue).await {
                Ok(stream) => {
                    info!(queue = %self.queue, reconnect = reconnecting, "Consuming");
                    backoff = backoff_builder.build();
                    match self.forward(stream, &mut errors, &mut stop).await {
                        StreamEnd::Stopped => break,
                        StreamEnd::Disconnected => {
                            warn!(queue = %self.queue, "Consumer disconnected, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, queue = %self.queue, "Failed to consume, retrying after backoff");
                }
            }

            reconnecting = true;
            let delay = backoff.next().unwrap_or(RECONNECT_MAX_DELAY);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => {}
            }
        }
        info!(queue = %self.queue, "Consumer stopped");
    }

    async fn forward(
        &self,
        mut stream: mpsc::UnboundedReceiver<Delivery>,
        errors: &mut tokio::sync::broadcast::Receiver<crate::broker::BrokerError>,
        stop: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return StreamEnd::Stopped;
                    }
                }
                err = errors.recv() => {
                    match err {
                        Ok(e) => warn!(error = %e, "Broker connection error"),
                        Err(e) => warn!(error = %e, "Broker error channel interrupted"),
                    }
                    return StreamEnd::Disconnected;
                }
                delivery = stream.recv() => {
                    let Some(delivery) = delivery else {
                        return StreamEnd::Disconnected;
                    };
                    tokio::select! {
                        sent = self.inbound.send(delivery) => {
                            if sent.is_err() {
                                return StreamEnd::Stopped;
                            }
                        }
                        _ = stop.changed() => return StreamEnd::Stopped,
                    }
                }
            }
        }
    }
}
