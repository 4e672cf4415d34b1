use std::str::FromStr;

use clap::{Parser, ValueEnum};
use ticket_sync::{MergePolicy, SyncConfig};

#[derive(Debug, Parser)]
#[command(
    name = "ticket-dash",
    about = "Follow a live ticket collection from the terminal"
)]
pub struct Cli {
    /// Server base url (overrides TICKET_SYNC_BASE_URL).
    #[arg(long)]
    pub base_url: Option<String>,
    /// Stream endpoint; defaults to <base>/stream/issues.
    #[arg(long)]
    pub stream_url: Option<String>,
    #[arg(long)]
    pub collection: Option<String>,
    #[arg(long)]
    pub page_size: Option<u32>,
    #[arg(long, value_enum)]
    pub merge_policy: Option<PolicyArg>,
    /// Ticket id to show in full after every change.
    #[arg(long, env = "TICKET_DASH_SELECT")]
    pub select: Option<String>,
    /// Pages to load before waiting for input.
    #[arg(long, default_value_t = 1)]
    pub preload: u32,
    #[arg(long)]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    StreamWins,
    NewestWins,
}

impl From<PolicyArg> for MergePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::StreamWins => MergePolicy::StreamWins,
            PolicyArg::NewestWins => MergePolicy::NewestWins,
        }
    }
}

impl Cli {
    /// Layers command-line flags over the environment configuration.
    pub fn apply(&self, mut cfg: SyncConfig) -> SyncConfig {
        if let Some(base_url) = &self.base_url {
            cfg.base_url = base_url.clone();
        }
        if let Some(stream_url) = &self.stream_url {
            cfg.stream_url = Some(stream_url.clone());
        }
        if let Some(collection) = &self.collection {
            cfg.collection = collection.clone();
        }
        if let Some(page_size) = self.page_size {
            cfg.page_size = page_size;
        }
        if let Some(policy) = self.merge_policy {
            cfg.merge_policy = policy.into();
        }
        if let Some(filter) = &self.log_filter {
            cfg.log_filter = filter.clone();
        }
        cfg.normalize()
    }
}

/// One line typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DashCommand {
    /// Empty line or `more`: fetch the next page.
    LoadMore,
    Restart,
    Reset,
    Select(Option<String>),
    Status { id: String, status: i64 },
    Quit,
}

impl FromStr for DashCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = match words.next() {
            None | Some("more") | Some("m") => DashCommand::LoadMore,
            Some("restart") => DashCommand::Restart,
            Some("reset") => DashCommand::Reset,
            Some("select") => DashCommand::Select(words.next().map(str::to_string)),
            Some("status") => {
                let id = words.next().ok_or("usage: status <id> <value>")?;
                let status = words
                    .next()
                    .ok_or("usage: status <id> <value>")?
                    .parse()
                    .map_err(|_| "status value must be an integer".to_string())?;
                DashCommand::Status {
                    id: id.to_string(),
                    status,
                }
            }
            Some("quit") | Some("q") | Some("exit") => DashCommand::Quit,
            Some(other) => return Err(format!("unknown command {other}")),
        };
        Ok(command)
    }
}
