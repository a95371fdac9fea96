use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ImapSettings;
use crate::error::TrackerError;
use crate::models::RawEmail;

/// Source of emails. The polling loop only needs "everything on or after
/// this instant, oldest first, at most `limit`".
pub trait Mailbox {
    fn fetch(&mut self, since: DateTime<Utc>, limit: usize) -> Result<Vec<RawEmail>, TrackerError>;
}

const IO_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ImapMailbox {
    settings: ImapSettings,
}

impl ImapMailbox {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }
}

impl Mailbox for ImapMailbox {
    /// One connection per fetch. Failures anywhere in the conversation
    /// surface as transport errors and the whole fetch is retried on the
    /// next cycle.
    fn fetch(&mut self, since: DateTime<Utc>, limit: usize) -> Result<Vec<RawEmail>, TrackerError> {
        let server = self.settings.server.as_str();
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| TrackerError::transport(format!("TLS setup failed: {e}")))?;

        let addr = (server, self.settings.port)
            .to_socket_addrs()
            .map_err(|e| TrackerError::transport(format!("cannot resolve {server}: {e}")))?
            .next()
            .ok_or_else(|| TrackerError::transport(format!("no address for {server}")))?;
        let tcp = TcpStream::connect_timeout(&addr, IO_TIMEOUT)
            .map_err(|e| TrackerError::transport(format!("connect to {server} failed: {e}")))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))
            .and_then(|_| tcp.set_write_timeout(Some(IO_TIMEOUT)))
            .map_err(|e| TrackerError::transport(e))?;
        let stream = tls
            .connect(server, tcp)
            .map_err(|e| TrackerError::transport(format!("TLS handshake with {server} failed: {e}")))?;
        let mut client = imap::Client::new(stream);
        client
            .read_greeting()
            .map_err(|e| TrackerError::transport(format!("no IMAP greeting from {server}: {e}")))?;

        let password = self.settings.password()?;
        let mut session = client
            .login(&self.settings.username, &password)
            .map_err(|(e, _)| TrackerError::transport(format!("IMAP login failed: {e}")))?;

        session
            .select("INBOX")
            .map_err(|e| TrackerError::transport(format!("IMAP select failed: {e}")))?;

        // IMAP SINCE has date granularity; sub-day filtering happens below.
        let query = format!("SINCE {}", since.format("%d-%b-%Y"));
        let uids = session
            .uid_search(&query)
            .map_err(|e| TrackerError::transport(format!("IMAP search failed: {e}")))?;

        let mut emails = Vec::new();
        if !uids.is_empty() {
            let set = uids
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let fetches = session
                .uid_fetch(&set, "RFC822")
                .map_err(|e| TrackerError::transport(format!("IMAP fetch failed: {e}")))?;

            for fetch in fetches.iter() {
                let uid = fetch.uid.unwrap_or_default();
                let Some(raw) = fetch.body() else {
                    warn!(uid, "fetched message has no body");
                    continue;
                };
                match parse_message(raw, uid) {
                    Some(email) if email.timestamp >= since => emails.push(email),
                    Some(email) => {
                        debug!(id = %email.id, "before cutoff, skipping");
                    }
                    None => warn!(uid, "unparsable message, skipping"),
                }
            }
        }

        session.logout().ok();

        emails.sort_by_key(|e| e.timestamp);
        emails.truncate(limit);
        debug!(count = emails.len(), "mailbox fetch complete");
        Ok(emails)
    }
}

/// Parse one RFC822 message into a `RawEmail`. Returns None when the
/// message cannot be parsed at all; individual missing headers degrade
/// to empty fields instead.
fn parse_message(raw: &[u8], uid: u32) -> Option<RawEmail> {
    let mail = mailparse::parse_mail(raw).ok()?;
    let headers = &mail.headers;

    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let sender = headers.get_first_value("From").unwrap_or_default();

    let timestamp = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())?;

    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| strip_angle_brackets(&v))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("uid-{uid}"));

    let thread_id = thread_id_from_headers(headers).unwrap_or_else(|| message_id.clone());

    Some(RawEmail {
        id: message_id,
        subject,
        body: extract_body(&mail),
        sender,
        timestamp,
        thread_id,
    })
}

/// Conversation identity: the root of the References chain, then
/// In-Reply-To, so every reply lands in the same thread as the first
/// message. A message with neither starts its own thread.
fn thread_id_from_headers(headers: &[mailparse::MailHeader<'_>]) -> Option<String> {
    if let Some(refs) = headers.get_first_value("References") {
        if let Some(first) = refs.split_whitespace().next() {
            let id = strip_angle_brackets(first);
            if !id.is_empty() {
                return Some(id);
            }
        }
    }
    headers
        .get_first_value("In-Reply-To")
        .map(|v| strip_angle_brackets(&v))
        .filter(|v| !v.is_empty())
}

fn strip_angle_brackets(s: &str) -> String {
    s.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Pull a readable text body out of the MIME tree: a text/plain part if
/// one exists anywhere, otherwise text/html run through the HTML
/// stripper, otherwise whatever the top level holds.
fn extract_body(mail: &ParsedMail<'_>) -> String {
    if let Some(text) = find_part(mail, "text/plain") {
        return text;
    }
    if let Some(html) = find_part(mail, "text/html") {
        return html_to_text(&html);
    }
    let body = mail.get_body().unwrap_or_default();
    if mail.ctype.mimetype.eq_ignore_ascii_case("text/html") {
        html_to_text(&body)
    } else {
        body
    }
}

fn find_part(mail: &ParsedMail<'_>, mimetype: &str) -> Option<String> {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return mail.get_body().ok();
        }
        return None;
    }
    mail.subparts.iter().find_map(|part| find_part(part, mimetype))
}

fn html_to_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let text: Vec<&str> = document.root_element().text().collect();
    text.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN_MESSAGE: &str = "Message-ID: <abc@mail.example>\r\n\
        Subject: Your application\r\n\
        From: Jane Doe <jane@acme.com>\r\n\
        Date: Mon, 2 Jun 2025 10:30:00 +0000\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Thanks for applying to Acme.\r\n";

    #[test]
    fn test_parse_plain_message() {
        let email = parse_message(PLAIN_MESSAGE.as_bytes(), 7).unwrap();
        assert_eq!(email.id, "abc@mail.example");
        assert_eq!(email.subject, "Your application");
        assert_eq!(email.sender, "Jane Doe <jane@acme.com>");
        assert!(email.body.contains("Thanks for applying"));
        // no References/In-Reply-To: starts its own thread
        assert_eq!(email.thread_id, "abc@mail.example");
        assert_eq!(email.timestamp.format("%Y-%m-%d %H:%M").to_string(), "2025-06-02 10:30");
    }

    #[test]
    fn test_thread_root_comes_from_references() {
        let msg = "Message-ID: <reply2@mail.example>\r\n\
            References: <root@mail.example> <reply1@mail.example>\r\n\
            In-Reply-To: <reply1@mail.example>\r\n\
            Subject: Re: interview\r\n\
            From: jane@acme.com\r\n\
            Date: Mon, 2 Jun 2025 11:00:00 +0000\r\n\
            \r\n\
            Sounds good.\r\n";
        let email = parse_message(msg.as_bytes(), 8).unwrap();
        assert_eq!(email.thread_id, "root@mail.example");
    }

    #[test]
    fn test_in_reply_to_fallback() {
        let msg = "Message-ID: <reply1@mail.example>\r\n\
            In-Reply-To: <root@mail.example>\r\n\
            Subject: Re: interview\r\n\
            From: jane@acme.com\r\n\
            Date: Mon, 2 Jun 2025 11:00:00 +0000\r\n\
            \r\n\
            Sure.\r\n";
        let email = parse_message(msg.as_bytes(), 9).unwrap();
        assert_eq!(email.thread_id, "root@mail.example");
    }

    #[test]
    fn test_missing_message_id_uses_uid() {
        let msg = "Subject: hello\r\n\
            From: x@y.com\r\n\
            Date: Mon, 2 Jun 2025 11:00:00 +0000\r\n\
            \r\n\
            body\r\n";
        let email = parse_message(msg.as_bytes(), 42).unwrap();
        assert_eq!(email.id, "uid-42");
        assert_eq!(email.thread_id, "uid-42");
    }

    #[test]
    fn test_unparsable_date_is_dropped() {
        let msg = "Subject: hello\r\nFrom: x@y.com\r\n\r\nbody\r\n";
        assert!(parse_message(msg.as_bytes(), 1).is_none());
    }

    #[test]
    fn test_html_body_stripped() {
        let msg = "Message-ID: <h@mail.example>\r\n\
            Subject: Offer\r\n\
            From: hr@acme.com\r\n\
            Date: Mon, 2 Jun 2025 11:00:00 +0000\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <html><body><p>We are <b>pleased</b> to offer you the role.</p></body></html>\r\n";
        let email = parse_message(msg.as_bytes(), 3).unwrap();
        assert_eq!(email.body, "We are pleased to offer you the role.");
    }

    #[test]
    fn test_multipart_prefers_plain_text() {
        let msg = "Message-ID: <m@mail.example>\r\n\
            Subject: Update\r\n\
            From: hr@acme.com\r\n\
            Date: Mon, 2 Jun 2025 11:00:00 +0000\r\n\
            Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
            \r\n\
            --sep\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            plain version\r\n\
            --sep\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>html version</p>\r\n\
            --sep--\r\n";
        let email = parse_message(msg.as_bytes(), 4).unwrap();
        assert!(email.body.contains("plain version"));
        assert!(!email.body.contains("html"));
    }

    #[test]
    fn test_strip_angle_brackets() {
        assert_eq!(strip_angle_brackets(" <a@b> "), "a@b");
        assert_eq!(strip_angle_brackets("a@b"), "a@b");
    }
}
