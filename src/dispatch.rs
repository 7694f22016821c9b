//! Fire-and-forget side effects.
//!
//! The lifecycle controller emits events only after its transaction commits;
//! this task turns them into notification and message rows. A failure here is
//! logged and dropped, it can never undo or fail the transition that caused it.

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::db::inbox::InboxStore;
use crate::lifecycle::RideEvent;

pub fn spawn(inbox: InboxStore, mut events: UnboundedReceiver<RideEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            deliver(&inbox, event).await;
        }
        tracing::debug!("ride event channel closed, dispatcher stopping");
    })
}

async fn deliver(inbox: &InboxStore, event: RideEvent) {
    match event {
        RideEvent::RequestAccepted {
            ride_id,
            parent_id,
            driver_id,
            otp,
        } => {
            if let Err(err) = inbox
                .notify(
                    parent_id,
                    "Ride accepted",
                    "A driver accepted your ride request. Share the pickup code at pickup.",
                    "ride_update",
                    Some(ride_id),
                )
                .await
            {
                tracing::error!(%ride_id, "failed to notify parent of acceptance: {err}");
            }
            // the pickup code travels as a chat message from the driver
            if let Err(err) = inbox
                .send_message(
                    driver_id,
                    parent_id,
                    &format!("Your pickup code is {otp}"),
                    Some(ride_id),
                )
                .await
            {
                tracing::error!(%ride_id, "failed to deliver pickup code message: {err}");
            }
        }
        RideEvent::RideStarted { ride_id, parent_id } => {
            if let Err(err) = inbox
                .notify(
                    parent_id,
                    "Ride started",
                    "Pickup confirmed, your child is on the way.",
                    "ride_update",
                    Some(ride_id),
                )
                .await
            {
                tracing::error!(%ride_id, "failed to notify parent of start: {err}");
            }
        }
        RideEvent::RideCompleted {
            ride_id,
            parent_id,
            fare,
        } => {
            if let Err(err) = inbox
                .notify(
                    parent_id,
                    "Ride completed",
                    &format!("Your child has arrived. Fare charged: {fare}"),
                    "ride_update",
                    Some(ride_id),
                )
                .await
            {
                tracing::error!(%ride_id, "failed to notify parent of completion: {err}");
            }
        }
        RideEvent::RideCancelled {
            ride_id,
            cancelled_by_type,
            counterparty,
            reason,
            fine,
            reopened,
        } => {
            let Some(counterparty) = counterparty else {
                return;
            };
            let mut content = if reopened {
                "The driver released your ride; it is open for other drivers again.".to_string()
            } else {
                format!("Your ride was cancelled by the {}.", cancelled_by_type.as_str())
            };
            if let Some(reason) = reason {
                content.push_str(&format!(" Reason: {reason}."));
            }
            if let Some(fine) = fine {
                content.push_str(&format!(" A cancellation fine of {fine} was applied."));
            }
            if let Err(err) = inbox
                .notify(counterparty, "Ride cancelled", &content, "ride_update", Some(ride_id))
                .await
            {
                tracing::error!(%ride_id, "failed to notify counterparty of cancellation: {err}");
            }
        }
    }
}
