//! Notification dispatch: payload in, one send attempt, outcome out.

use std::{fmt, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{
    address::{self, DestinationAddress, ExtractionError},
    connection::{ConnectionManager, SendError},
};

/// Message sent for every booking notification.
pub const BOOKING_MESSAGE: &str = "Thanks for the booking. 🎉";

/// Inbound notification, as posted by the mail-search job.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "emailBody", default)]
    pub body: String,
    #[serde(default)]
    pub subject: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    EmptyBody,
    NoAddressFound,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::EmptyBody => f.write_str("Email body is required"),
            RejectReason::NoAddressFound => f.write_str("No phone number found in email"),
        }
    }
}

impl From<ExtractionError> for RejectReason {
    fn from(e: ExtractionError) -> Self {
        match e {
            ExtractionError::NotFound => RejectReason::NoAddressFound,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent,
    Rejected(RejectReason),
    Failed(SendError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub normalized_address: Option<DestinationAddress>,
}

impl DispatchOutcome {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            status: DispatchStatus::Rejected(reason),
            normalized_address: None,
        }
    }
}

/// Turns notification payloads into single send attempts.
///
/// No retries here: re-delivery policy belongs to whoever posted the payload.
pub struct DispatchService {
    connection: Arc<ConnectionManager>,
    send_timeout: Duration,
}

impl DispatchService {
    pub fn new(connection: Arc<ConnectionManager>, send_timeout: Duration) -> Self {
        Self {
            connection,
            send_timeout,
        }
    }

    pub async fn dispatch(&self, payload: &NotificationPayload) -> DispatchOutcome {
        if payload.body.trim().is_empty() {
            return DispatchOutcome::rejected(RejectReason::EmptyBody);
        }

        let address = match address::extract(&payload.body) {
            Ok(a) => address::normalize(&a),
            Err(e) => {
                tracing::info!(subject = %payload.subject, "no phone number found in notification");
                return DispatchOutcome::rejected(e.into());
            }
        };
        let to = address.chat_address();

        // The send cannot be cancelled; on timeout it may still complete out of band.
        let result = match tokio::time::timeout(
            self.send_timeout,
            self.connection.send(&to, BOOKING_MESSAGE),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(SendError::Timeout),
        };

        let status = match result {
            Ok(()) => {
                tracing::info!(phone = %address.e164(), "booking message sent");
                DispatchStatus::Sent
            }
            Err(e) => {
                tracing::warn!(phone = %address.e164(), error = %e, "booking message failed");
                DispatchStatus::Failed(e)
            }
        };

        DispatchOutcome {
            status,
            normalized_address: Some(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        connection::{ClientEvent, ConnectionState, EventSender, MessagingClient},
        domain::{ChatAddress, ClientId, PairingCode, SessionBlob},
        errors::Error,
        Result,
    };

    #[derive(Clone, Copy, Default, PartialEq)]
    enum SendMode {
        #[default]
        Ok,
        Fail,
        Hang,
    }

    /// Client that becomes ready as soon as it starts.
    #[derive(Default)]
    struct InstantClient {
        ready: bool,
        mode: SendMode,
        sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagingClient for InstantClient {
        async fn start(&self, _session: Option<SessionBlob>, events: EventSender) -> Result<()> {
            let _ = events.send(ClientEvent::PairingCode(PairingCode("code".to_string())));
            if self.ready {
                let _ = events.send(ClientEvent::Authenticated(None));
                let _ = events.send(ClientEvent::Ready);
            }
            Ok(())
        }

        async fn send_text(&self, to: &ChatAddress, text: &str) -> Result<()> {
            match self.mode {
                SendMode::Ok => {
                    self.sent
                        .lock()
                        .unwrap()
                        .push((to.0.clone(), text.to_string()));
                    Ok(())
                }
                SendMode::Fail => Err(Error::External("phone not on WhatsApp".to_string())),
                SendMode::Hang => std::future::pending().await,
            }
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn service(client: Arc<InstantClient>, timeout: Duration) -> DispatchService {
        let ready = client.ready;
        let mgr = Arc::new(ConnectionManager::new(
            client,
            None,
            ClientId("whatsapp-bot".to_string()),
        ));
        mgr.initialize(None).await.unwrap();
        let mut rx = mgr.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| {
                if ready {
                    s.is_ready()
                } else {
                    matches!(s, ConnectionState::AwaitingPairing(_))
                }
            }),
        )
        .await
        .unwrap()
        .unwrap();
        DispatchService::new(mgr, timeout)
    }

    fn payload(body: &str) -> NotificationPayload {
        NotificationPayload {
            body: body.to_string(),
            subject: "New booking".to_string(),
        }
    }

    #[tokio::test]
    async fn sends_booking_message_to_extracted_number() {
        let client = Arc::new(InstantClient {
            ready: true,
            ..Default::default()
        });
        let svc = service(client.clone(), Duration::from_secs(1)).await;

        let out = svc
            .dispatch(&payload("CountryCode: +91\nPhone: 9876543210"))
            .await;
        assert_eq!(out.status, DispatchStatus::Sent);
        assert_eq!(
            out.normalized_address.map(|a| a.e164()).as_deref(),
            Some("+919876543210")
        );
        assert_eq!(
            client.sent.lock().unwrap().clone(),
            vec![("919876543210@c.us".to_string(), BOOKING_MESSAGE.to_string())]
        );
    }

    #[tokio::test]
    async fn blank_body_is_rejected() {
        let client = Arc::new(InstantClient {
            ready: true,
            ..Default::default()
        });
        let svc = service(client.clone(), Duration::from_secs(1)).await;

        for body in ["", "   \n\t"] {
            let out = svc.dispatch(&payload(body)).await;
            assert_eq!(out.status, DispatchStatus::Rejected(RejectReason::EmptyBody));
            assert_eq!(out.normalized_address, None);
        }
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn body_without_markers_is_rejected() {
        let client = Arc::new(InstantClient {
            ready: true,
            ..Default::default()
        });
        let svc = service(client.clone(), Duration::from_secs(1)).await;

        let out = svc.dispatch(&payload("no relevant fields here")).await;
        assert_eq!(
            out.status,
            DispatchStatus::Rejected(RejectReason::NoAddressFound)
        );
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn not_ready_is_a_failure_with_address() {
        let client = Arc::new(InstantClient::default());
        let svc = service(client.clone(), Duration::from_secs(1)).await;

        let out = svc
            .dispatch(&payload("CountryCode: +44\nPhone: 7700900123"))
            .await;
        assert_eq!(out.status, DispatchStatus::Failed(SendError::NotReady));
        assert!(out.normalized_address.is_some());
        assert!(client.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let client = Arc::new(InstantClient {
            ready: true,
            mode: SendMode::Fail,
            ..Default::default()
        });
        let svc = service(client, Duration::from_secs(1)).await;

        let out = svc
            .dispatch(&payload("CountryCode: +1\nPhone: 5551234"))
            .await;
        assert!(matches!(
            out.status,
            DispatchStatus::Failed(SendError::Transport(ref m)) if m.contains("not on WhatsApp")
        ));
    }

    #[tokio::test]
    async fn hung_send_times_out() {
        let client = Arc::new(InstantClient {
            ready: true,
            mode: SendMode::Hang,
            ..Default::default()
        });
        let svc = service(client, Duration::from_millis(50)).await;

        let out = svc
            .dispatch(&payload("CountryCode: +1\nPhone: 5551234"))
            .await;
        assert_eq!(out.status, DispatchStatus::Failed(SendError::Timeout));
    }

    #[test]
    fn payload_uses_wire_names_and_defaults_subject() {
        let p: NotificationPayload =
            serde_json::from_str(r#"{"emailBody":"CountryCode: +91"}"#).unwrap();
        assert_eq!(p.body, "CountryCode: +91");
        assert_eq!(p.subject, "");
    }
}
