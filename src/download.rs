use crate::bounces::BounceStore;
use crate::config::Config;
use crate::mailbox::{parse_pop_address, MailboxClient, MboxMailbox, Pop3Mailbox};
use crate::subscribers::SubscriberStore;
use anyhow::{bail, Result};
use chrono::Utc;

/// Accumulated textual summary of one download run, one line per mailbox that
/// was processed successfully.
#[derive(Debug, Default, Clone)]
pub struct DownloadReport {
    pub lines: Vec<String>,
    pub downloaded: u64,
}

impl DownloadReport {
    pub fn summary(&self) -> String {
        self.lines.join("\n")
    }
}

/// Build one client per configured mailbox for the selected protocol. An
/// unrecognized protocol is a hard failure, raised before anything is touched.
pub fn build_clients(protocol: &str, config: &Config) -> Result<Vec<Box<dyn MailboxClient>>> {
    match protocol {
        "pop" => {
            let mut clients: Vec<Box<dyn MailboxClient>> = Vec::new();
            for address in &config.pop.mailboxes {
                let (host, port, names) = parse_pop_address(address)?;
                for name in names {
                    clients.push(Box::new(Pop3Mailbox::new(
                        &host,
                        port,
                        &name,
                        &config.pop.username,
                        &config.pop.password,
                    )));
                }
            }
            Ok(clients)
        }
        "mbox" => Ok(config
            .mbox
            .paths
            .iter()
            .map(|path| Box::new(MboxMailbox::new(path)) as Box<dyn MailboxClient>)
            .collect()),
        other => bail!("Unsupported protocol: {other}"),
    }
}

/// Downloads undeliverable-message notifications from each configured mailbox
/// and persists them as bounce records. One mailbox failing only skips that
/// mailbox; the rest are still processed.
pub struct DownloadProcessor {
    bounces: BounceStore,
    subscribers: SubscriberStore,
    test_mode: bool,
}

impl DownloadProcessor {
    pub fn new(bounces: BounceStore, subscribers: SubscriberStore, test_mode: bool) -> Self {
        DownloadProcessor {
            bounces,
            subscribers,
            test_mode,
        }
    }

    pub fn run(&self, clients: &mut [Box<dyn MailboxClient>]) -> Result<DownloadReport> {
        let mut report = DownloadReport::default();

        for client in clients {
            let label = client.label();
            match self.process_mailbox(client.as_mut()) {
                Ok(count) => {
                    log::info!("Downloaded {count} bounces from {label}");
                    report.downloaded += count;
                    report.lines.push(format!("{count} bounces downloaded from {label}"));
                }
                Err(e) => {
                    // Fatal for this mailbox only; no report line for it.
                    log::error!("Skipping mailbox {label}: {e:#}");
                }
            }
        }

        Ok(report)
    }

    fn process_mailbox(&self, client: &mut dyn MailboxClient) -> Result<u64> {
        client.open()?;
        let count = client.message_count()?;
        let mut downloaded = 0u64;

        for msg in 1..=count {
            let header = client.fetch_header(msg)?;
            let body = client.fetch_body(msg)?;
            let date = client.fetch_date(msg)?.unwrap_or_else(Utc::now);

            let bounce_id = self.bounces.insert(&header, &body, date)?;
            self.link_bounce(bounce_id, &header, &body)?;
            downloaded += 1;

            if self.test_mode {
                log::debug!("Test mode: leaving message {msg} in place");
            } else {
                client.delete(msg)?;
            }
        }

        client.close(!self.test_mode)?;
        Ok(downloaded)
    }

    /// Tie the bounce back to the outbound message/subscriber pairing using
    /// the headers the outbound mailer stamped on the original message, which
    /// most MTAs echo back in the notification.
    fn link_bounce(&self, bounce_id: i64, header: &str, body: &str) -> Result<()> {
        let text = format!("{header}\n\n{body}");
        let Some(email) = extract_list_member(&text) else {
            log::debug!("Bounce {bounce_id} carries no subscriber identification");
            return Ok(());
        };
        let Some(subscriber) = self.subscribers.find_by_email(&email)? else {
            log::debug!("Bounce {bounce_id} references unknown subscriber {email}");
            return Ok(());
        };
        let message_id = extract_message_id(&text).unwrap_or(0);
        self.bounces.link_to_message(bounce_id, subscriber.id, message_id)?;
        self.subscribers.increment_bounce_count(subscriber.id)?;
        Ok(())
    }
}

/// Value of the first `X-ListMember:` line anywhere in the bounce text; the
/// header often sits inside the returned original rather than the outer
/// notification, so this scans line-wise instead of parsing one header block.
pub(crate) fn extract_list_member(text: &str) -> Option<String> {
    find_stamped_header(text, "x-listmember:")
}

pub(crate) fn extract_message_id(text: &str) -> Option<i64> {
    find_stamped_header(text, "x-messageid:").and_then(|v| v.parse().ok())
}

fn find_stamped_header(text: &str, prefix: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        lower
            .strip_prefix(prefix)
            .map(|_| line[prefix.len()..].trim().to_string())
            .filter(|v| !v.is_empty())
    })
}
