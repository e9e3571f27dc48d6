//! Outbound email for booking confirmations and admin alerts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::MailConfig;
use crate::notify::Notice;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail transport: {0}")]
    Transport(String),
    #[error("mail provider rejected message: {status} {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), MailError>;
}

/// Resend HTTP API.
pub struct ResendMailer {
    client: Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl ResendMailer {
    pub fn new(api_key: String, from: String) -> Result<Self, MailError> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            from,
            endpoint: RESEND_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Serialize)]
struct ResendPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let payload = ResendPayload {
            from: &self.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailError::Transport(e.without_url().to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected { status, body });
        }
        Ok(())
    }
}

/// Writes messages to the log instead of sending them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        tracing::info!("mail (not sent) to {}: {}", email.to, email.subject);
        Ok(())
    }
}

/// Resend when an API key is configured, otherwise the log.
pub fn mailer_from_config(config: &MailConfig) -> Result<Box<dyn Mailer>, MailError> {
    match &config.resend_api_key {
        Some(key) => Ok(Box::new(ResendMailer::new(key.clone(), config.from.clone())?)),
        None => {
            tracing::warn!("RESEND_API_KEY not set, emails will only be logged");
            Ok(Box::new(LogMailer))
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Messages for one notice: the guest confirmation (bookings only) and the
/// admin alert when an alert address is set.
pub fn compose(notice: &Notice, alert_to: Option<&str>) -> Vec<Email> {
    let mut out = Vec::new();
    match notice {
        Notice::Booked {
            group,
            unit_ids,
            range,
            guest_name,
            guest_email,
        } => {
            let (start, end) = (range.start, range.end);
            let what = match group {
                Some(slug) => slug.clone(),
                None => format!("unit {}", unit_ids.first().map(|u| u.to_string()).unwrap_or_default()),
            };
            out.push(Email {
                to: guest_email.clone(),
                subject: format!("Booking confirmed — {what} {start}–{end}"),
                html: format!(
                    "<p>Thank you {name},</p><p>Your booking for <strong>{what}</strong> from {start} to {end} is confirmed.</p>",
                    name = escape_html(guest_name),
                    what = escape_html(&what),
                ),
                text: format!("Booking confirmed: {start}–{end}"),
            });
            if let Some(admin) = alert_to {
                let (subject, body) = match group {
                    Some(slug) => (
                        "New Direct Booking (Grouped)",
                        format!(
                            "Property {slug}: {start}–{end} Guest: {guest_name} ({guest_email}) on {} OTA listings",
                            unit_ids.len()
                        ),
                    ),
                    None => (
                        "New Direct Booking",
                        format!("{what}: {start}–{end} Guest: {guest_name} ({guest_email})"),
                    ),
                };
                out.push(alert(admin, subject, body));
            }
        }
        Notice::ManualBlock {
            unit_id,
            range,
            source,
            note,
        } => {
            if let Some(admin) = alert_to {
                let body = format!("Unit {unit_id}: {range} blocked ({source}) {note}");
                out.push(alert(admin, "Manual Block", body.trim_end().to_string()));
            }
        }
    }
    out
}

fn alert(to: &str, subject: &str, body: String) -> Email {
    Email {
        to: to.to_string(),
        subject: subject.to_string(),
        html: format!("<pre>{}</pre>", escape_html(&body)),
        text: body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateRange, Source};
    use ulid::Ulid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn booked(group: Option<&str>) -> Notice {
        Notice::Booked {
            group: group.map(str::to_string),
            unit_ids: vec![Ulid::new(), Ulid::new()],
            range: DateRange::parse("2025-11-01", "2025-11-04").unwrap(),
            guest_name: "Ada <script>".into(),
            guest_email: "ada@example.com".into(),
        }
    }

    #[test]
    fn booking_mails_guest_and_admin() {
        let mails = compose(&booked(Some("villa")), Some("owner@example.com"));
        assert_eq!(mails.len(), 2);
        assert_eq!(mails[0].to, "ada@example.com");
        assert_eq!(mails[0].subject, "Booking confirmed — villa 2025-11-01–2025-11-04");
        assert!(mails[0].html.contains("Ada &lt;script&gt;"));
        assert_eq!(mails[1].to, "owner@example.com");
        assert_eq!(mails[1].subject, "New Direct Booking (Grouped)");
        assert!(mails[1].text.ends_with("on 2 OTA listings"));
    }

    #[test]
    fn missing_alert_address_skips_admin_mail() {
        let mails = compose(&booked(None), None);
        assert_eq!(mails.len(), 1);
        assert!(mails[0].subject.starts_with("Booking confirmed — unit "));

        let manual = Notice::ManualBlock {
            unit_id: Ulid::new(),
            range: DateRange::parse("2025-11-01", "2025-11-02").unwrap(),
            source: Source::Manual,
            note: String::new(),
        };
        assert!(compose(&manual, None).is_empty());
        assert_eq!(compose(&manual, Some("owner@example.com")).len(), 1);
    }

    #[tokio::test]
    async fn resend_posts_json_with_bearer_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/emails"))
            .and(header("authorization", "Bearer re_test"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":"1"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let mailer = ResendMailer::new("re_test".into(), "RoomSync <a@b.c>".into())
            .unwrap()
            .with_endpoint(format!("{}/emails", server.uri()));
        let mail = &compose(&booked(Some("villa")), None)[0];
        mailer.send(mail).await.unwrap();

        let received = &server.received_requests().await.unwrap()[0];
        let body: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(body["to"][0], "ada@example.com");
        assert_eq!(body["from"], "RoomSync <a@b.c>");
    }

    #[tokio::test]
    async fn resend_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad from"))
            .mount(&server)
            .await;

        let mailer = ResendMailer::new("k".into(), "x".into())
            .unwrap()
            .with_endpoint(server.uri());
        let err = mailer.send(&compose(&booked(None), None)[0]).await.unwrap_err();
        assert!(matches!(err, MailError::Rejected { status: 422, .. }));
    }
}
