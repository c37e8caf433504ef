use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{AlertChannel, Notification, NotifyError};
use crate::config::EmailConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Split a comma-separated receiver list into mailboxes.
pub fn parse_receivers(list: &str) -> Result<Vec<Mailbox>, NotifyError> {
    let receivers = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Mailbox>().map_err(|e| NotifyError::Settings {
                service: "Email",
                reason: format!("bad receiver {s:?}: {e}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if receivers.is_empty() {
        return Err(NotifyError::Settings {
            service: "Email",
            reason: "no receivers".into(),
        });
    }
    Ok(receivers)
}

/// Operator alerts over SMTP with implicit TLS.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailChannel {
    pub fn new(config: &EmailConfig) -> Result<Self, NotifyError> {
        let from = config.from_address.parse::<Mailbox>().map_err(|e| NotifyError::Settings {
            service: "Email",
            reason: format!("bad sender address: {e}"),
        })?;
        let to = parse_receivers(&config.receivers)?;

        let tls = TlsParameters::builder(config.smtp_host.clone())
            .dangerous_accept_invalid_certs(config.allow_self_signed)
            .build()?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
            .port(config.smtp_port)
            .tls(Tls::Wrapper(tls))
            .credentials(Credentials::new(
                config.from_address.clone(),
                config.from_password.clone(),
            ))
            .timeout(Some(CONNECT_TIMEOUT))
            .build();

        Ok(Self { transport, from, to })
    }

    fn message(&self, notification: &Notification) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(notification.title.as_str())
            .header(ContentType::TEXT_PLAIN);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        Ok(builder.body(notification.text.clone())?)
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = self.message(notification)?;
        self.transport.send(message).await?;
        Ok(())
    }
}
