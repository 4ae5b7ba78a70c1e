//! Consumption of submission messages from the broker.

use crate::config::BrokerSettings;
use crate::executor::ExecutionEngine;
use crate::processor::Processor;
use crate::store::SubmissionStore;
use amiquip::{Connection, ConsumerMessage, ConsumerOptions, QueueDeclareOptions};
use anyhow::Context;
use log::info;

/// Connection to the submission queue.
pub struct BrokerConsumer {
    connection: Connection,
}

impl BrokerConsumer {
    /// Open the broker connection for the configured wiring.
    pub fn connect(settings: &BrokerSettings) -> Result<Self, amiquip::Error> {
        let url = settings.amqp_url();
        let connection = match settings {
            BrokerSettings::Development { host } => {
                info!("connecting to the broker at {host}");
                Connection::insecure_open(&url)?
            }
            BrokerSettings::Production { .. } => Connection::open(&url)?,
        };
        Ok(BrokerConsumer { connection })
    }

    /// Consume `queue_name` until the stream ends, delivering every message to
    /// `processor` and acknowledging it only after processing succeeded.
    ///
    /// The prefetch window is pinned to a single unacknowledged delivery and processing
    /// happens on this thread, so exactly one submission is in flight at a time. A
    /// processing failure stops the loop with the message unacknowledged; the broker
    /// redelivers it once the connection is gone.
    pub fn run<E, S>(
        self,
        queue_name: &str,
        processor: &mut Processor<E, S>,
    ) -> anyhow::Result<()>
    where
        E: ExecutionEngine,
        S: SubmissionStore,
    {
        let mut connection = self.connection;
        let channel = connection.open_channel(None)?;
        channel.qos(0, 1, false)?;
        let queue = channel.queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
        )?;

        info!("waiting for submissions on {queue_name}");
        let consumer = queue.consume(ConsumerOptions::default())?;
        for message in consumer.receiver().iter() {
            match message {
                ConsumerMessage::Delivery(delivery) => {
                    processor
                        .process(&delivery.body)
                        .context("processing a submission failed")?;
                    consumer.ack(delivery)?;
                }
                other => {
                    info!("consumer stream ended: {other:?}");
                    break;
                }
            }
        }

        connection.close()?;
        Ok(())
    }
}
