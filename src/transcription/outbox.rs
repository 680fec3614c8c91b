//! Ordered per-connection delivery of recognition results.
//!
//! Recognitions for one session may finish out of order on the worker pool. The
//! outbox re-establishes submission order: a single forwarding task awaits the
//! pending handles one by one and forwards each outcome to the connection actor.
//! A final result therefore never overtakes an older partial, and the
//! `session_ended` acknowledgment is released only after everything submitted
//! before it.

use crate::transcription::dispatcher::RecognitionResult;
use actix::prelude::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Delivered to the connection actor in submission order.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub enum Delivery {
    Result {
        session_serial: u64,
        session_id: String,
        is_final: bool,
        result: RecognitionResult,
    },
    /// Every recognition queued before the end request has been delivered
    Ended { session_serial: u64 },
}

enum Pending {
    Recognition {
        session_serial: u64,
        session_id: String,
        is_final: bool,
        handle: JoinHandle<RecognitionResult>,
    },
    End {
        session_serial: u64,
    },
}

/// Sending half of a connection's ordered result queue.
///
/// Dropping the outbox ends the forwarding task once the queue drains.
pub struct SessionOutbox {
    queue: mpsc::UnboundedSender<Pending>,
}

impl SessionOutbox {
    /// Start the forwarding task for one connection.
    pub fn spawn(recipient: Recipient<Delivery>) -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel::<Pending>();

        tokio::spawn(async move {
            while let Some(item) = pending.recv().await {
                let delivery = match item {
                    Pending::Recognition {
                        session_serial,
                        session_id,
                        is_final,
                        handle,
                    } => {
                        let result = handle.await.unwrap_or_else(|err| {
                            RecognitionResult::failure(format!("recognition task failed: {}", err))
                        });
                        Delivery::Result {
                            session_serial,
                            session_id,
                            is_final,
                            result,
                        }
                    }
                    Pending::End { session_serial } => Delivery::Ended { session_serial },
                };

                if recipient.connected() {
                    recipient.do_send(delivery);
                } else {
                    debug!(?delivery, "Connection closed; discarding delivery");
                }
            }
        });

        Self { queue }
    }

    pub fn push(
        &self,
        session_serial: u64,
        session_id: String,
        is_final: bool,
        handle: JoinHandle<RecognitionResult>,
    ) {
        let item = Pending::Recognition {
            session_serial,
            session_id,
            is_final,
            handle,
        };
        if self.queue.send(item).is_err() {
            debug!(session_serial, "Outbox forwarder gone; recognition dropped");
        }
    }

    /// Queue the end-of-session marker behind every pending recognition.
    pub fn push_end(&self, session_serial: u64) {
        if self.queue.send(Pending::End { session_serial }).is_err() {
            debug!(session_serial, "Outbox forwarder gone; end marker dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Records every delivery it receives.
    struct Collector {
        seen: Arc<parking_lot::Mutex<Vec<Delivery>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Delivery> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Delivery, _ctx: &mut Self::Context) {
            self.seen.lock().push(msg);
        }
    }

    fn recognition(text: &str, delay_ms: u64) -> JoinHandle<RecognitionResult> {
        let text = text.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let mut result = RecognitionResult::failure("");
            result.transcript = text;
            result.error = None;
            result
        })
    }

    fn label(delivery: &Delivery) -> String {
        match delivery {
            Delivery::Result { result, is_final, .. } => {
                format!("{}{}", if *is_final { "F:" } else { "P:" }, result.transcript)
            }
            Delivery::Ended { .. } => "ended".to_string(),
        }
    }

    #[actix_web::test]
    async fn test_slow_partial_does_not_get_overtaken() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let addr = Collector { seen: seen.clone() }.start();
        let outbox = SessionOutbox::spawn(addr.recipient());

        // P1 finishes last but was submitted first
        outbox.push(1, "s".into(), false, recognition("p1", 150));
        outbox.push(1, "s".into(), false, recognition("p2", 10));
        outbox.push(1, "s".into(), true, recognition("final", 0));
        outbox.push_end(1);

        tokio::time::sleep(Duration::from_millis(400)).await;

        let labels: Vec<String> = seen.lock().iter().map(label).collect();
        assert_eq!(labels, vec!["P:p1", "P:p2", "F:final", "ended"]);
    }

    #[actix_web::test]
    async fn test_failed_task_still_delivers() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let addr = Collector { seen: seen.clone() }.start();
        let outbox = SessionOutbox::spawn(addr.recipient());

        let aborted = recognition("never", 10_000);
        aborted.abort();
        outbox.push(7, "s".into(), true, aborted);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            Delivery::Result { session_serial, result, .. } => {
                assert_eq!(*session_serial, 7);
                assert!(result.is_failure());
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
    }
}
