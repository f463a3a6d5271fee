//! SMTP email integration (`email-send`).
//!
//! Speaks SMTP over implicit TLS (port 465 by default) with `AUTH LOGIN`.
//! The command builders are pure functions so the dialogue can be tested
//! without a server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::ClientConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};

use crate::catalog::Credentials;
use crate::error::{AdapterError, Result};
use crate::traits::{
    ActionOutput, ActionRequest, Capability, DeliveryReceipt, HealthStatus, Integration,
};

const DEFAULT_SMTP_PORT: u16 = 465;

const IO_TIMEOUT_SECS: u64 = 30;

const NAME: &str = "email";

type SmtpReader = BufReader<ReadHalf<TlsStream<TcpStream>>>;
type SmtpWriter = WriteHalf<TlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// SMTP command builders
// ---------------------------------------------------------------------------

pub fn smtp_ehlo_command(domain: &str) -> String {
    format!("EHLO {domain}\r\n")
}

pub fn smtp_auth_login_command() -> String {
    "AUTH LOGIN\r\n".to_string()
}

/// Base64 line used for the `AUTH LOGIN` username/password steps.
pub fn smtp_auth_line(input: &str) -> String {
    use base64::Engine;
    format!(
        "{}\r\n",
        base64::engine::general_purpose::STANDARD.encode(input)
    )
}

pub fn smtp_mail_from_command(from: &str) -> String {
    format!("MAIL FROM:<{from}>\r\n")
}

pub fn smtp_rcpt_to_command(to: &str) -> String {
    format!("RCPT TO:<{to}>\r\n")
}

pub fn smtp_data_command() -> String {
    "DATA\r\n".to_string()
}

/// Full message for the DATA phase, terminated by `.`.
///
/// Body lines are normalized to CRLF and dot-stuffed so a line holding a
/// single `.` cannot end the message early.
pub fn smtp_message_body(from: &str, to: &str, subject: &str, body: &str) -> String {
    let body = body
        .lines()
        .map(|line| {
            if line.starts_with('.') {
                format!(".{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n");

    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=UTF-8\r\n\
         \r\n\
         {body}\r\n\
         .\r\n"
    )
}

pub fn smtp_quit_command() -> String {
    "QUIT\r\n".to_string()
}

/// Status code of an SMTP reply line (`250 OK` → 250).
fn reply_status(line: &str) -> u16 {
    line.get(..3).and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Whether a reply line is the last of a multi-line reply (`250 ` vs `250-`).
fn is_final_reply_line(line: &str) -> bool {
    line.as_bytes().get(3).is_none_or(|b| *b == b' ')
}

// ---------------------------------------------------------------------------
// TLS helpers
// ---------------------------------------------------------------------------

fn tls_client_config() -> Arc<ClientConfig> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

async fn connect_tls(host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(tls_client_config());
    let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())
        .map_err(|e| AdapterError::Config(format!("invalid SMTP host '{host}': {e}")))?;
    let addr = format!("{host}:{port}");
    let timeout = Duration::from_secs(IO_TIMEOUT_SECS);

    let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| AdapterError::Timeout {
            seconds: IO_TIMEOUT_SECS,
            reason: format!("TCP connection to {addr} timed out"),
        })?
        .map_err(|e| failed(format!("TCP connection to {addr} failed: {e}")))?;

    tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AdapterError::Timeout {
            seconds: IO_TIMEOUT_SECS,
            reason: format!("TLS handshake with {host} timed out"),
        })?
        .map_err(|e| failed(format!("TLS handshake with {host} failed: {e}")))
}

/// Read one (possibly multi-line) SMTP reply.
async fn read_reply(reader: &mut SmtpReader) -> Result<(u16, Vec<String>)> {
    let mut lines = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(IO_TIMEOUT_SECS);

    loop {
        let mut line = String::new();
        match tokio::time::timeout_at(deadline, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let trimmed = line.trim_end().to_string();
                debug!(smtp_line = %trimmed, "SMTP reply line");
                let done = is_final_reply_line(&trimmed);
                lines.push(trimmed);
                if done {
                    break;
                }
            }
            Ok(Err(e)) => return Err(failed(format!("SMTP read error: {e}"))),
            Err(_) => {
                return Err(AdapterError::Timeout {
                    seconds: IO_TIMEOUT_SECS,
                    reason: "SMTP reply timed out".into(),
                });
            }
        }
    }

    let status = lines.first().map(|l| reply_status(l)).unwrap_or(0);
    Ok((status, lines))
}

/// Send one command and require a reply in the `expected` hundred-range.
async fn command(
    writer: &mut SmtpWriter,
    reader: &mut SmtpReader,
    cmd: &str,
    expected: u16,
) -> Result<()> {
    writer
        .write_all(cmd.as_bytes())
        .await
        .map_err(|e| failed(format!("SMTP write error: {e}")))?;
    let (status, lines) = read_reply(reader).await?;
    if status / 100 != expected / 100 {
        return Err(failed(format!(
            "SMTP error: expected {}xx, got {status}: {}",
            expected / 100,
            lines.join("; ")
        )));
    }
    Ok(())
}

fn failed(reason: String) -> AdapterError {
    AdapterError::ExecutionFailed {
        integration: NAME.into(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

/// SMTP account settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Recipient used when a request names none.
    pub default_to: Option<String>,
}

/// Sends plain-text email through one SMTP account.
pub struct SmtpMailer {
    settings: Option<SmtpSettings>,
}

impl SmtpMailer {
    pub fn new(settings: Option<SmtpSettings>) -> Self {
        Self { settings }
    }

    /// Build from `SMTP_SERVER`, `SMTP_PORT`, `SMTP_USER`, `SMTP_PASSWORD`
    /// and `EMAIL_TO`. The mailer is unconfigured if any required key is
    /// missing.
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        let port = match credentials.get("SMTP_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| AdapterError::Config(format!("SMTP_PORT is not a port: {raw}")))?,
            None => DEFAULT_SMTP_PORT,
        };

        let settings = match (
            credentials.get("SMTP_SERVER"),
            credentials.get("SMTP_USER"),
            credentials.get("SMTP_PASSWORD"),
        ) {
            (Some(host), Some(user), Some(password)) => Some(SmtpSettings {
                host: host.to_owned(),
                port,
                username: user.to_owned(),
                password: password.to_owned(),
                default_to: credentials
                    .get("EMAIL_TO")
                    .map(str::to_owned)
                    .or_else(|| Some(user.to_owned())),
            }),
            _ => None,
        };
        Ok(Self::new(settings))
    }

    fn settings(&self) -> Result<&SmtpSettings> {
        self.settings
            .as_ref()
            .ok_or_else(|| AdapterError::MissingCredentials {
                integration: NAME.into(),
                keys: vec![
                    "SMTP_SERVER".into(),
                    "SMTP_USER".into(),
                    "SMTP_PASSWORD".into(),
                ],
            })
    }

    /// Run the full SMTP dialogue for one message.
    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<DeliveryReceipt> {
        let settings = self.settings()?;
        info!(host = %settings.host, to = %to, subject = %subject, "sending email");

        let tls = connect_tls(&settings.host, settings.port).await?;
        let (read_half, mut writer) = tokio::io::split(tls);
        let mut reader = BufReader::new(read_half);

        let (greeting, _) = read_reply(&mut reader).await?;
        if greeting / 100 != 2 {
            return Err(failed(format!(
                "SMTP server rejected connection with status {greeting}"
            )));
        }

        let steps = [
            (smtp_ehlo_command("flowsmith.local"), 250),
            (smtp_auth_login_command(), 334),
            (smtp_auth_line(&settings.username), 334),
            (smtp_auth_line(&settings.password), 235),
            (smtp_mail_from_command(&settings.username), 250),
            (smtp_rcpt_to_command(to), 250),
            (smtp_data_command(), 354),
            (smtp_message_body(&settings.username, to, subject, body), 250),
        ];
        for (cmd, expected) in &steps {
            command(&mut writer, &mut reader, cmd, *expected).await?;
        }
        let _ = writer.write_all(smtp_quit_command().as_bytes()).await;

        Ok(DeliveryReceipt {
            integration: NAME.to_string(),
            target: to.to_string(),
            message_id: None,
        })
    }
}

#[async_trait]
impl Integration for SmtpMailer {
    fn name(&self) -> &str {
        NAME
    }

    fn capability(&self) -> Capability {
        Capability::EmailSend
    }

    fn is_configured(&self) -> bool {
        self.settings.is_some()
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(match &self.settings {
            Some(s) if s.default_to.is_some() => HealthStatus::Healthy,
            Some(_) => HealthStatus::Degraded,
            None => HealthStatus::Unhealthy,
        })
    }

    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput> {
        let capability = request.capability();
        let ActionRequest::Email { to, subject, body } = request else {
            return Err(AdapterError::Unsupported {
                integration: NAME.into(),
                capability: capability.to_string(),
            });
        };

        let to = match to {
            Some(to) => to,
            None => self
                .settings()?
                .default_to
                .clone()
                .ok_or_else(|| AdapterError::InvalidParams {
                    integration: NAME.into(),
                    reason: "no recipient given and EMAIL_TO is not set".into(),
                })?,
        };

        self.send(&to, &subject, &body)
            .await
            .map(ActionOutput::Delivered)
    }
}
