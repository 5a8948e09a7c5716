use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: String,
    pub lock_name: String,
    pub rules_batch_size: usize,
    pub consecutive_bounce_threshold: u32,
    pub blacklist_reason: String,
    pub pop: PopConfig,
    pub mbox: MboxConfig,
}

/// Remote POP-style mailboxes. Each address uses the
/// `{host:port}name[,name...]` format; an empty name means `INBOX`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopConfig {
    pub username: String,
    pub password: String,
    pub mailboxes: Vec<String>,
}

/// Local mbox spool files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MboxConfig {
    pub paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: "/var/lib/bounce-sweeper/bounces.db".to_string(),
            lock_name: "bounce_processor".to_string(),
            rules_batch_size: 1000,
            consecutive_bounce_threshold: 5,
            blacklist_reason: "bounced too many times".to_string(),
            pop: PopConfig {
                username: String::new(),
                password: String::new(),
                mailboxes: vec!["{localhost:110}INBOX".to_string()],
            },
            mbox: MboxConfig { paths: Vec::new() },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
