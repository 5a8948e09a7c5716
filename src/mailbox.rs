use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

/// One mail store holding bounce notifications. Messages are numbered 1..=count
/// in store-native order; `delete` only marks, `close(true)` finalizes.
pub trait MailboxClient: std::fmt::Debug {
    fn open(&mut self) -> Result<()>;
    fn message_count(&mut self) -> Result<usize>;
    fn fetch_header(&mut self, msg: usize) -> Result<String>;
    fn fetch_body(&mut self, msg: usize) -> Result<String>;
    fn fetch_date(&mut self, msg: usize) -> Result<Option<DateTime<Utc>>>;
    fn delete(&mut self, msg: usize) -> Result<()>;
    fn close(&mut self, expunge: bool) -> Result<()>;
    /// Human-readable identity for the download report.
    fn label(&self) -> String;
}

/// Parse a POP-style mailbox address `{host:port}name[,name...]`.
///
/// Names are trimmed; an empty name (or no name at all) defaults to `INBOX`.
pub fn parse_pop_address(address: &str) -> Result<(String, u16, Vec<String>)> {
    let rest = address
        .strip_prefix('{')
        .ok_or_else(|| anyhow!("Invalid mailbox address (expected {{host:port}}name): {address}"))?;
    let (endpoint, names_part) = rest
        .split_once('}')
        .ok_or_else(|| anyhow!("Invalid mailbox address (missing '}}'): {address}"))?;

    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid port in mailbox address: {address}"))?;
            (host.to_string(), port)
        }
        None => (endpoint.to_string(), 110),
    };
    if host.is_empty() {
        bail!("Empty host in mailbox address: {address}");
    }

    let names: Vec<String> = if names_part.trim().is_empty() {
        vec!["INBOX".to_string()]
    } else {
        names_part
            .split(',')
            .map(|name| {
                let name = name.trim();
                if name.is_empty() {
                    "INBOX".to_string()
                } else {
                    name.to_string()
                }
            })
            .collect()
    };

    Ok((host, port, names))
}

/// Split a raw RFC 822 message into header and body text.
pub fn split_message(raw: &str) -> (String, String) {
    for separator in ["\r\n\r\n", "\n\n"] {
        if let Some(pos) = raw.find(separator) {
            let header = raw[..pos].to_string();
            let body = raw[pos + separator.len()..].to_string();
            return (header, body);
        }
    }
    (raw.to_string(), String::new())
}

/// Parse the `Date:` header out of raw header text.
pub fn header_date(header: &str) -> Option<DateTime<Utc>> {
    let (headers, _) = mailparse::parse_headers(header.as_bytes()).ok()?;
    let value = headers
        .iter()
        .find(|h| h.get_key().eq_ignore_ascii_case("Date"))
        .map(|h| h.get_value())?;
    let epoch = mailparse::dateparse(&value).ok()?;
    DateTime::from_timestamp(epoch, 0)
}

#[derive(Debug)]
struct Pop3Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

/// Blocking POP3 client: USER/PASS, STAT, TOP, RETR, DELE, RSET, QUIT.
#[derive(Debug)]
pub struct Pop3Mailbox {
    host: String,
    port: u16,
    mailbox: String,
    username: String,
    password: String,
    conn: Option<Pop3Connection>,
}

impl Pop3Mailbox {
    pub fn new(host: &str, port: u16, mailbox: &str, username: &str, password: &str) -> Self {
        Pop3Mailbox {
            host: host.to_string(),
            port,
            mailbox: mailbox.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut Pop3Connection> {
        let label = self.label_string();
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow!("POP3 mailbox {} is not open", label))
    }

    fn label_string(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.mailbox)
    }

    fn command(&mut self, cmd: &str) -> Result<String> {
        let conn = self.conn()?;
        conn.writer.write_all(cmd.as_bytes())?;
        conn.writer.write_all(b"\r\n")?;
        conn.writer.flush()?;
        read_response_line(&mut conn.reader)
    }

    /// Issue a command, then read the multiline payload terminated by a lone
    /// dot. POP3 dot-stuffing: a leading "." in content arrives as "..".
    fn command_multiline(&mut self, cmd: &str) -> Result<String> {
        self.command(cmd)?;
        let conn = self.conn()?;
        let mut out = String::new();
        loop {
            let mut line = String::new();
            let n = conn.reader.read_line(&mut line)?;
            if n == 0 {
                bail!("Connection closed mid-response");
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line == "." {
                break;
            }
            let unstuffed = line.strip_prefix('.').filter(|_| line.starts_with("..")).unwrap_or(line);
            out.push_str(unstuffed);
            out.push('\n');
        }
        Ok(out)
    }
}

fn read_response_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        bail!("Connection closed by server");
    }
    let line = line.trim_end().to_string();
    if line.starts_with("+OK") {
        Ok(line)
    } else {
        bail!("POP3 server error: {line}")
    }
}

impl MailboxClient for Pop3Mailbox {
    fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .with_context(|| format!("Failed to connect to {}:{}", self.host, self.port))?;
        let writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        // Greeting, then authentication; any failure drops the connection
        // without leaving an open handle behind.
        read_response_line(&mut reader).context("POP3 greeting failed")?;
        self.conn = Some(Pop3Connection { reader, writer });

        let user = format!("USER {}", self.username);
        let pass = format!("PASS {}", self.password);
        if let Err(e) = self.command(&user).and_then(|_| self.command(&pass)) {
            self.conn = None;
            return Err(e.context(format!("POP3 login failed for {}", self.label_string())));
        }
        Ok(())
    }

    fn message_count(&mut self) -> Result<usize> {
        let line = self.command("STAT")?;
        // +OK count size
        let count = line
            .strip_prefix("+OK")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow!("Malformed STAT response: {line}"))?;
        Ok(count)
    }

    fn fetch_header(&mut self, msg: usize) -> Result<String> {
        let raw = self.command_multiline(&format!("TOP {msg} 0"))?;
        let (header, _) = split_message(&raw);
        Ok(header)
    }

    fn fetch_body(&mut self, msg: usize) -> Result<String> {
        let raw = self.command_multiline(&format!("RETR {msg}"))?;
        let (_, body) = split_message(&raw);
        Ok(body)
    }

    fn fetch_date(&mut self, msg: usize) -> Result<Option<DateTime<Utc>>> {
        let header = self.fetch_header(msg)?;
        Ok(header_date(&header))
    }

    fn delete(&mut self, msg: usize) -> Result<()> {
        self.command(&format!("DELE {msg}"))?;
        Ok(())
    }

    fn close(&mut self, expunge: bool) -> Result<()> {
        if self.conn.is_none() {
            return Ok(());
        }
        if !expunge {
            // RSET un-marks everything the session deleted.
            self.command("RSET")?;
        }
        let result = self.command("QUIT");
        self.conn = None;
        result.map(|_| ())
    }

    fn label(&self) -> String {
        self.label_string()
    }
}

/// Local mbox spool. Messages are split on `From ` separator lines; deletion
/// marks in memory and `close(true)` rewrites the file without the marked
/// messages.
#[derive(Debug)]
pub struct MboxMailbox {
    path: String,
    messages: Vec<String>,
    deleted: Vec<bool>,
    opened: bool,
}

impl MboxMailbox {
    pub fn new(path: &str) -> Self {
        MboxMailbox {
            path: path.to_string(),
            messages: Vec::new(),
            deleted: Vec::new(),
            opened: false,
        }
    }

    fn message(&self, msg: usize) -> Result<&str> {
        self.messages
            .get(msg.checked_sub(1).ok_or_else(|| anyhow!("Message numbers start at 1"))?)
            .map(|s| s.as_str())
            .ok_or_else(|| anyhow!("No message {msg} in {}", self.path))
    }

    /// Raw message text without the leading `From ` separator line.
    fn message_content(&self, msg: usize) -> Result<String> {
        let raw = self.message(msg)?;
        let content = match raw.split_once('\n') {
            Some((first, rest)) if first.starts_with("From ") => rest,
            _ => raw,
        };
        Ok(content.to_string())
    }
}

impl MailboxClient for MboxMailbox {
    fn open(&mut self) -> Result<()> {
        let mut file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open mbox file: {}", self.path))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .with_context(|| format!("Failed to read mbox file: {}", self.path))?;

        self.messages.clear();
        let mut current = String::new();
        for line in content.lines() {
            if line.starts_with("From ") && !current.is_empty() {
                self.messages.push(std::mem::take(&mut current));
            }
            current.push_str(line);
            current.push('\n');
        }
        if !current.trim().is_empty() {
            self.messages.push(current);
        }
        self.deleted = vec![false; self.messages.len()];
        self.opened = true;
        Ok(())
    }

    fn message_count(&mut self) -> Result<usize> {
        if !self.opened {
            bail!("mbox {} is not open", self.path);
        }
        Ok(self.messages.len())
    }

    fn fetch_header(&mut self, msg: usize) -> Result<String> {
        let content = self.message_content(msg)?;
        Ok(split_message(&content).0)
    }

    fn fetch_body(&mut self, msg: usize) -> Result<String> {
        let content = self.message_content(msg)?;
        Ok(split_message(&content).1)
    }

    fn fetch_date(&mut self, msg: usize) -> Result<Option<DateTime<Utc>>> {
        let header = self.fetch_header(msg)?;
        Ok(header_date(&header))
    }

    fn delete(&mut self, msg: usize) -> Result<()> {
        self.message(msg)?;
        self.deleted[msg - 1] = true;
        Ok(())
    }

    fn close(&mut self, expunge: bool) -> Result<()> {
        if !self.opened {
            return Ok(());
        }
        if expunge && self.deleted.iter().any(|&d| d) {
            let kept: String = self
                .messages
                .iter()
                .zip(&self.deleted)
                .filter(|(_, &deleted)| !deleted)
                .map(|(raw, _)| raw.as_str())
                .collect();
            std::fs::write(&self.path, kept)
                .with_context(|| format!("Failed to rewrite mbox file: {}", self.path))?;
        }
        self.messages.clear();
        self.deleted.clear();
        self.opened = false;
        Ok(())
    }

    fn label(&self) -> String {
        self.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MBOX: &str = "From bounce@lists.example.com Thu Jan  4 09:00:00 2024\n\
Date: Thu, 04 Jan 2024 09:00:00 +0000\n\
From: MAILER-DAEMON@mx.example.com\n\
Subject: Undelivered Mail Returned to Sender\n\
\n\
550 5.1.1 user unknown\n\
From bounce@lists.example.com Thu Jan  4 09:05:00 2024\n\
Date: Thu, 04 Jan 2024 09:05:00 +0000\n\
From: postmaster@other.example.net\n\
Subject: Delivery Status Notification (Failure)\n\
\n\
552 5.2.2 mailbox full\n";

    fn sample_mbox_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_MBOX.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_pop_address_single() {
        let (host, port, names) = parse_pop_address("{mail.example.com:110}INBOX").unwrap();
        assert_eq!(host, "mail.example.com");
        assert_eq!(port, 110);
        assert_eq!(names, vec!["INBOX"]);
    }

    #[test]
    fn test_parse_pop_address_defaults() {
        let (host, port, names) = parse_pop_address("{mail.example.com}").unwrap();
        assert_eq!(host, "mail.example.com");
        assert_eq!(port, 110);
        assert_eq!(names, vec!["INBOX"]);
    }

    #[test]
    fn test_parse_pop_address_multiple_names_trimmed() {
        let (_, _, names) = parse_pop_address("{mx:995}Bounces, ,Returned ").unwrap();
        assert_eq!(names, vec!["Bounces", "INBOX", "Returned"]);
    }

    #[test]
    fn test_parse_pop_address_rejects_garbage() {
        assert!(parse_pop_address("mail.example.com").is_err());
        assert!(parse_pop_address("{mail.example.com:notaport}INBOX").is_err());
    }

    #[test]
    fn test_split_message() {
        let (header, body) = split_message("A: 1\nB: 2\n\nbody line\n");
        assert_eq!(header, "A: 1\nB: 2");
        assert_eq!(body, "body line\n");
    }

    #[test]
    fn test_split_message_without_body() {
        let (header, body) = split_message("A: 1\nB: 2\n");
        assert_eq!(header, "A: 1\nB: 2\n");
        assert_eq!(body, "");
    }

    #[test]
    fn test_header_date() {
        let date = header_date("Date: Thu, 04 Jan 2024 09:00:00 +0000\n").unwrap();
        assert_eq!(date.to_rfc3339(), "2024-01-04T09:00:00+00:00");
        assert!(header_date("Subject: no date here\n").is_none());
    }

    #[test]
    fn test_mbox_iterates_messages_in_order() {
        let file = sample_mbox_file();
        let mut mbox = MboxMailbox::new(file.path().to_str().unwrap());
        mbox.open().unwrap();
        assert_eq!(mbox.message_count().unwrap(), 2);

        let header = mbox.fetch_header(1).unwrap();
        assert!(header.contains("Undelivered Mail Returned to Sender"));
        assert!(!header.contains("From bounce@lists.example.com"));
        assert_eq!(mbox.fetch_body(1).unwrap().trim(), "550 5.1.1 user unknown");
        assert_eq!(mbox.fetch_body(2).unwrap().trim(), "552 5.2.2 mailbox full");
        assert!(mbox.fetch_date(1).unwrap().is_some());
    }

    #[test]
    fn test_mbox_expunge_rewrites_file() {
        let file = sample_mbox_file();
        let path = file.path().to_str().unwrap().to_string();
        let mut mbox = MboxMailbox::new(&path);
        mbox.open().unwrap();
        mbox.delete(1).unwrap();
        mbox.close(true).unwrap();

        let mut reopened = MboxMailbox::new(&path);
        reopened.open().unwrap();
        assert_eq!(reopened.message_count().unwrap(), 1);
        assert_eq!(reopened.fetch_body(1).unwrap().trim(), "552 5.2.2 mailbox full");
    }

    #[test]
    fn test_mbox_close_without_expunge_keeps_messages() {
        let file = sample_mbox_file();
        let path = file.path().to_str().unwrap().to_string();
        let mut mbox = MboxMailbox::new(&path);
        mbox.open().unwrap();
        mbox.delete(1).unwrap();
        mbox.close(false).unwrap();

        let mut reopened = MboxMailbox::new(&path);
        reopened.open().unwrap();
        assert_eq!(reopened.message_count().unwrap(), 2);
    }

    #[test]
    fn test_mbox_open_missing_file_fails() {
        let mut mbox = MboxMailbox::new("/nonexistent/bounces.mbox");
        assert!(mbox.open().is_err());
    }

    #[test]
    fn test_pop3_open_unreachable_leaves_no_handle() {
        // Port 1 on localhost should refuse the connection.
        let mut pop = Pop3Mailbox::new("127.0.0.1", 1, "INBOX", "user", "secret");
        assert!(pop.open().is_err());
        assert!(pop.conn.is_none());
    }
}
